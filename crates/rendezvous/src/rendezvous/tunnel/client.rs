//! Connection-side library: dials a relay and registers as a server or a
//! client, then exposes the tunnel as commands in and events out.

use std::{collections::HashMap, fmt, time::Duration};

use anyhow::Context;
use bytes::Bytes;
use serde_json::{Value, json};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf},
    sync::{mpsc, watch},
    time::Instant,
};
use uuid::Uuid;

use crate::rendezvous::{
    net, telemetry,
    tunnel::{
        api::{
            self, AuthenticateParams, AuthenticateReply, AuthenticationError, ClientConnectedParams,
            ClientDisconnectedParams, DisconnectClientParams, HelloReply, RegisterClientParams,
            RegisterServerParams, RegisterServerReply, TunnelProxyError, TunnelProxyReply,
        },
        keepalive::{self, KeepaliveAction, KeepaliveSupervisor},
        rpc::{self, LineBuffer, RpcMessage, RpcNotification, RpcReply, RpcRequest},
        slip::{self, SlipDecoder},
        transport::{BoxedStream, TlsDialOptions, TransportDialOptions, transport_by_name},
    },
};

const READ_BUFFER_BYTES: usize = 32 * 1024;
const PING_EXPIRY: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelRole {
    Server {
        server_uuid: Uuid,
        server_name: String,
    },
    Client {
        client_uuid: Uuid,
        client_name: String,
        server_uuid: Uuid,
    },
}

impl TunnelRole {
    pub fn uuid(&self) -> Uuid {
        match self {
            TunnelRole::Server { server_uuid, .. } => *server_uuid,
            TunnelRole::Client { client_uuid, .. } => *client_uuid,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            TunnelRole::Server { server_name, .. } => server_name,
            TunnelRole::Client { client_name, .. } => client_name,
        }
    }

    pub fn is_server(&self) -> bool {
        matches!(self, TunnelRole::Server { .. })
    }
}

#[derive(Debug, Clone)]
pub struct TunnelClientOptions {
    pub relay_addr: String,
    pub transport: String,
    pub tls: TlsDialOptions,
    pub role: TunnelRole,
    /// Sent with `Authentication.Authenticate`; the step is skipped when empty.
    pub token: String,
    pub nonce: Option<String>,
    pub auto_reconnect: bool,
    pub connect_timeout: Duration,
    pub call_timeout: Duration,
    pub ping_interval: Duration,
    pub reconnect_interval: Duration,
}

impl TunnelClientOptions {
    pub fn new(relay_addr: impl Into<String>, role: TunnelRole) -> Self {
        Self {
            relay_addr: relay_addr.into(),
            transport: "tcp".into(),
            tls: TlsDialOptions::default(),
            role,
            token: String::new(),
            nonce: None,
            auto_reconnect: false,
            connect_timeout: Duration::from_secs(10),
            call_timeout: Duration::from_secs(5),
            ping_interval: keepalive::DEFAULT_PING_INTERVAL,
            reconnect_interval: keepalive::DEFAULT_RECONNECT_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientState {
    Disconnected,
    HostLookup,
    Connecting,
    Connected,
    Initializing,
    Authenticating,
    Registering,
    /// Registered as server; traffic is framed.
    Running,
    /// Registered as client; traffic is raw.
    RemoteConnected,
    Disconnecting,
}

impl ClientState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientState::Disconnected => "disconnected",
            ClientState::HostLookup => "host_lookup",
            ClientState::Connecting => "connecting",
            ClientState::Connected => "connected",
            ClientState::Initializing => "initializing",
            ClientState::Authenticating => "authenticating",
            ClientState::Registering => "registering",
            ClientState::Running => "running",
            ClientState::RemoteConnected => "remote_connected",
            ClientState::Disconnecting => "disconnecting",
        }
    }
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A client bound to this server, as announced by the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteClient {
    pub address: u16,
    pub client_uuid: String,
    pub client_name: String,
    pub peer_address: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    StateChanged(ClientState),
    ClientConnected(RemoteClient),
    ClientDisconnected { address: u16 },
    /// Server role: bytes from the client at `address`.
    Data { address: u16, payload: Bytes },
    /// Client role: bytes from the server.
    RemoteData(Bytes),
    Pong { timestamp: i64, round_trip: Duration },
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    #[error("tunnel client is {0}")]
    WrongState(ClientState),
    #[error("operation needs the {0} role")]
    WrongRole(&'static str),
    #[error("socket address {0} is reserved")]
    ReservedAddress(u16),
    #[error("tunnel client has stopped")]
    Stopped,
}

#[derive(Debug)]
pub(crate) enum Command {
    Connect,
    Reconnect,
    Disconnect,
    Send(Bytes),
    SendTo(u16, Bytes),
    DisconnectClient(u16),
    Ping,
    Shutdown,
}

impl From<KeepaliveAction> for Command {
    fn from(a: KeepaliveAction) -> Self {
        match a {
            KeepaliveAction::Ping => Command::Ping,
            KeepaliveAction::Reconnect => Command::Reconnect,
        }
    }
}

/// Handle to a tunnel connection driven by a background task.
///
/// Dropping every clone stops the driver.
#[derive(Debug, Clone)]
pub struct TunnelClient {
    cmd: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ClientState>,
    server_role: bool,
}

impl TunnelClient {
    pub fn spawn(opts: TunnelClientOptions) -> (Self, mpsc::UnboundedReceiver<ClientEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ClientState::Disconnected);
        let (ev_tx, ev_rx) = mpsc::unbounded_channel();

        let supervisor =
            KeepaliveSupervisor::new(opts.ping_interval, opts.reconnect_interval, opts.auto_reconnect);
        tokio::spawn(supervisor.run(state_rx.clone(), cmd_tx.downgrade()));

        let server_role = opts.role.is_server();
        let driver = Driver {
            opts,
            state: state_tx,
            events: ev_tx,
        };
        tokio::spawn(driver.run(cmd_rx));

        (
            Self {
                cmd: cmd_tx,
                state: state_rx,
                server_role,
            },
            ev_rx,
        )
    }

    pub fn state(&self) -> ClientState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ClientState> {
        self.state.clone()
    }

    pub async fn wait_for_state(&self, want: ClientState) -> Result<(), ClientError> {
        let mut rx = self.state.clone();
        rx.wait_for(|s| *s == want)
            .await
            .map(|_| ())
            .map_err(|_| ClientError::Stopped)
    }

    fn command(&self, c: Command) -> Result<(), ClientError> {
        self.cmd.send(c).map_err(|_| ClientError::Stopped)
    }

    fn require(&self, want: ClientState) -> Result<(), ClientError> {
        let cur = self.state();
        if cur != want {
            return Err(ClientError::WrongState(cur));
        }
        Ok(())
    }

    pub fn connect(&self) -> Result<(), ClientError> {
        self.command(Command::Connect)
    }

    pub fn disconnect(&self) -> Result<(), ClientError> {
        self.command(Command::Disconnect)
    }

    /// Client role: writes raw bytes to the server.
    pub fn send(&self, data: impl Into<Bytes>) -> Result<(), ClientError> {
        if self.server_role {
            return Err(ClientError::WrongRole("client"));
        }
        self.require(ClientState::RemoteConnected)?;
        self.command(Command::Send(data.into()))
    }

    /// Server role: writes bytes to the client at `address`.
    pub fn send_to(&self, address: u16, data: impl Into<Bytes>) -> Result<(), ClientError> {
        if !self.server_role {
            return Err(ClientError::WrongRole("server"));
        }
        if address == slip::CONTROL_ADDRESS || address == slip::INVALID_ADDRESS {
            return Err(ClientError::ReservedAddress(address));
        }
        self.require(ClientState::Running)?;
        self.command(Command::SendTo(address, data.into()))
    }

    /// Server role: asks the relay to drop the client at `address`.
    pub fn disconnect_client(&self, address: u16) -> Result<(), ClientError> {
        if !self.server_role {
            return Err(ClientError::WrongRole("server"));
        }
        self.require(ClientState::Running)?;
        self.command(Command::DisconnectClient(address))
    }

    pub fn ping(&self) -> Result<(), ClientError> {
        if !self.server_role {
            return Err(ClientError::WrongRole("server"));
        }
        self.require(ClientState::Running)?;
        self.command(Command::Ping)
    }

    pub fn shutdown(&self) {
        let _ = self.command(Command::Shutdown);
    }
}

enum Exit {
    Stopped,
    Shutdown,
}

struct Link {
    rd: ReadHalf<BoxedStream>,
    wr: WriteHalf<BoxedStream>,
    lines: LineBuffer,
    next_id: i64,
}

impl Link {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

struct Driver {
    opts: TunnelClientOptions,
    state: watch::Sender<ClientState>,
    events: mpsc::UnboundedSender<ClientEvent>,
}

impl Driver {
    fn set_state(&self, next: ClientState) {
        let changed = self.state.send_if_modified(|cur| {
            if *cur == next {
                return false;
            }
            *cur = next;
            true
        });
        if changed {
            tracing::debug!(relay = %self.opts.relay_addr, uuid = %self.opts.role.uuid(), state = %next, "tunnel client: state");
            self.emit(ClientEvent::StateChanged(next));
        }
    }

    fn emit(&self, ev: ClientEvent) {
        let _ = self.events.send(ev);
    }

    async fn run(self, mut cmds: mpsc::UnboundedReceiver<Command>) {
        let mut wanted = false;
        loop {
            match cmds.recv().await {
                None | Some(Command::Shutdown) => break,
                Some(Command::Connect) => wanted = true,
                Some(Command::Reconnect) if wanted => {}
                Some(Command::Disconnect) => {
                    wanted = false;
                    continue;
                }
                Some(_) => continue,
            }

            match self.session(&mut cmds).await {
                Ok(Exit::Stopped) => wanted = false,
                Ok(Exit::Shutdown) => {
                    self.set_state(ClientState::Disconnected);
                    break;
                }
                Err(err) => {
                    let state = *self.state.borrow();
                    if self.opts.auto_reconnect {
                        tracing::warn!(
                            relay = %self.opts.relay_addr,
                            uuid = %self.opts.role.uuid(),
                            state = %state,
                            err = %err,
                            retry_in = %humantime::format_duration(self.opts.reconnect_interval),
                            "tunnel client: connection lost; retrying"
                        );
                    } else {
                        tracing::warn!(
                            relay = %self.opts.relay_addr,
                            uuid = %self.opts.role.uuid(),
                            state = %state,
                            err = %err,
                            "tunnel client: connection lost"
                        );
                    }
                    self.emit(ClientEvent::Error(format!("{err:#}")));
                }
            }
            self.set_state(ClientState::Disconnected);
        }
    }

    async fn session(&self, cmds: &mut mpsc::UnboundedReceiver<Command>) -> anyhow::Result<Exit> {
        let establish = self.establish();
        tokio::pin!(establish);
        let link = loop {
            tokio::select! {
                res = &mut establish => break res?,
                cmd = cmds.recv() => match cmd {
                    None | Some(Command::Shutdown) => {
                        self.set_state(ClientState::Disconnecting);
                        return Ok(Exit::Shutdown);
                    }
                    Some(Command::Disconnect) => {
                        self.set_state(ClientState::Disconnecting);
                        return Ok(Exit::Stopped);
                    }
                    Some(_) => {}
                },
            }
        };

        if self.opts.role.is_server() {
            self.run_server(link, cmds).await
        } else {
            self.run_client(link, cmds).await
        }
    }

    async fn establish(&self) -> anyhow::Result<Link> {
        let tr = transport_by_name(&self.opts.transport)?;
        let limit = self.opts.connect_timeout;

        self.set_state(ClientState::HostLookup);
        let target = if tr.uses_host_lookup() {
            let addrs = tokio::time::timeout(limit, net::lookup(&self.opts.relay_addr))
                .await
                .context("tunnel client: host lookup timed out")??;
            addrs
                .first()
                .map(|a| a.to_string())
                .context("tunnel client: host lookup returned nothing")?
        } else {
            self.opts.relay_addr.clone()
        };

        self.set_state(ClientState::Connecting);
        let mut tls = self.opts.tls.clone();
        if tls.server_name.trim().is_empty() {
            tls.server_name = net::host_of(&self.opts.relay_addr).to_string();
        }
        let stream = tokio::time::timeout(limit, tr.dial(&target, TransportDialOptions { tls }))
            .await
            .context("tunnel client: connect timed out")??;
        self.set_state(ClientState::Connected);

        let (rd, wr) = tokio::io::split(stream);
        let mut link = Link {
            rd,
            wr,
            lines: LineBuffer::new(),
            next_id: 0,
        };

        self.set_state(ClientState::Initializing);
        let hello: HelloReply = self.call(&mut link, api::HELLO, json!({})).await?.into_params()?;
        tracing::debug!(relay = %self.opts.relay_addr, server = %hello.server, name = %hello.name, api_version = %hello.api_version, "tunnel client: relay hello");

        if !self.opts.token.is_empty() {
            self.set_state(ClientState::Authenticating);
            let params = AuthenticateParams {
                uuid: self.opts.role.uuid().to_string(),
                name: self.opts.role.name().to_string(),
                token: self.opts.token.clone(),
                nonce: self.opts.nonce.clone(),
            };
            let r: AuthenticateReply = self
                .call(&mut link, api::AUTHENTICATE, serde_json::to_value(params)?)
                .await?
                .into_params()?;
            if r.authentication_error != AuthenticationError::NoError {
                anyhow::bail!("tunnel client: authentication refused: {}", r.authentication_error);
            }
        }

        self.set_state(ClientState::Registering);
        match &self.opts.role {
            TunnelRole::Server {
                server_uuid,
                server_name,
            } => {
                let params = RegisterServerParams {
                    server_name: server_name.clone(),
                    server_uuid: server_uuid.to_string(),
                };
                let r: RegisterServerReply = self
                    .call(&mut link, api::REGISTER_SERVER, serde_json::to_value(params)?)
                    .await?
                    .into_params()?;
                if r.tunnel_proxy_error != TunnelProxyError::NoError {
                    anyhow::bail!("tunnel client: server registration refused: {}", r.tunnel_proxy_error);
                }
                if !r.slip_enabled {
                    anyhow::bail!("tunnel client: relay did not enable framing");
                }
            }
            TunnelRole::Client {
                client_uuid,
                client_name,
                server_uuid,
            } => {
                let params = RegisterClientParams {
                    client_name: client_name.clone(),
                    client_uuid: client_uuid.to_string(),
                    server_uuid: server_uuid.to_string(),
                };
                let r: TunnelProxyReply = self
                    .call(&mut link, api::REGISTER_CLIENT, serde_json::to_value(params)?)
                    .await?
                    .into_params()?;
                if r.tunnel_proxy_error != TunnelProxyError::NoError {
                    anyhow::bail!("tunnel client: client registration refused: {}", r.tunnel_proxy_error);
                }
            }
        }
        Ok(link)
    }

    /// One request/reply exchange on the unframed stream.
    async fn call(&self, link: &mut Link, method: &str, params: Value) -> anyhow::Result<RpcReply> {
        let id = link.next_id();
        let line = rpc::encode_line(&RpcRequest::new(id, method, params))?;
        link.wr.write_all(&line).await?;
        link.wr.flush().await?;
        tokio::time::timeout(self.opts.call_timeout, read_reply(link, id))
            .await
            .with_context(|| format!("tunnel client: {method} timed out"))?
    }

    async fn run_server(
        &self,
        link: Link,
        cmds: &mut mpsc::UnboundedReceiver<Command>,
    ) -> anyhow::Result<Exit> {
        let Link {
            mut rd,
            mut wr,
            mut lines,
            mut next_id,
        } = link;
        let mut slip = SlipDecoder::new();
        slip.feed(&lines.take_remaining());
        let mut pings: HashMap<i64, Instant> = HashMap::new();
        let mut buf = vec![0u8; READ_BUFFER_BYTES];

        self.set_state(ClientState::Running);
        tracing::info!(relay = %self.opts.relay_addr, uuid = %self.opts.role.uuid(), "tunnel client: server registered");
        self.drain_frames(&mut slip, &mut pings)?;

        loop {
            tokio::select! {
                n = rd.read(&mut buf) => {
                    let n = n?;
                    if n == 0 {
                        anyhow::bail!("tunnel client: relay closed the connection");
                    }
                    slip.feed(&buf[..n]);
                    self.drain_frames(&mut slip, &mut pings)?;
                }
                cmd = cmds.recv() => match cmd {
                    Some(Command::SendTo(address, data)) => {
                        wr.write_all(&slip::encode_frame(address, &data)).await?;
                        wr.flush().await?;
                    }
                    Some(Command::DisconnectClient(address)) => {
                        next_id += 1;
                        let params = serde_json::to_value(DisconnectClientParams { socket_address: address })?;
                        wr.write_all(&control_frame(next_id, api::DISCONNECT_CLIENT, params)?).await?;
                        wr.flush().await?;
                    }
                    Some(Command::Ping) => {
                        next_id += 1;
                        pings.retain(|_, sent| sent.elapsed() < PING_EXPIRY);
                        pings.insert(next_id, Instant::now());
                        let params = json!({ "timestamp": telemetry::now_unix_ms() as i64 });
                        wr.write_all(&control_frame(next_id, api::PING, params)?).await?;
                        wr.flush().await?;
                    }
                    Some(Command::Send(_)) => {
                        self.emit(ClientEvent::Error(ClientError::WrongRole("client").to_string()));
                    }
                    Some(Command::Connect | Command::Reconnect) => {}
                    Some(Command::Disconnect) => {
                        self.set_state(ClientState::Disconnecting);
                        let _ = wr.shutdown().await;
                        return Ok(Exit::Stopped);
                    }
                    None | Some(Command::Shutdown) => {
                        self.set_state(ClientState::Disconnecting);
                        let _ = wr.shutdown().await;
                        return Ok(Exit::Shutdown);
                    }
                },
            }
        }
    }

    fn drain_frames(
        &self,
        slip: &mut SlipDecoder,
        pings: &mut HashMap<i64, Instant>,
    ) -> anyhow::Result<()> {
        while let Some(frame) = slip.next_frame() {
            let frame = frame.context("tunnel client: bad frame from relay")?;
            if !frame.is_control() {
                self.emit(ClientEvent::Data {
                    address: frame.address,
                    payload: frame.payload,
                });
                continue;
            }
            match rpc::parse_message(&frame.payload)? {
                RpcMessage::Notification(n) => self.on_notification(n),
                RpcMessage::Reply(r) => {
                    if let Some(sent) = pings.remove(&r.id) {
                        let timestamp = r
                            .params
                            .as_ref()
                            .and_then(|p| p.get("timestamp"))
                            .and_then(Value::as_i64)
                            .unwrap_or_default();
                        self.emit(ClientEvent::Pong {
                            timestamp,
                            round_trip: sent.elapsed(),
                        });
                    } else if !r.is_success() {
                        self.emit(ClientEvent::Error(r.error.unwrap_or_else(|| "error reply".into())));
                    } else if let Ok(TunnelProxyReply { tunnel_proxy_error }) = r.into_params() {
                        if tunnel_proxy_error != TunnelProxyError::NoError {
                            self.emit(ClientEvent::Error(tunnel_proxy_error.to_string()));
                        }
                    }
                }
                RpcMessage::Request(r) => {
                    tracing::debug!(method = %r.method, "tunnel client: unexpected request from relay");
                }
            }
        }
        Ok(())
    }

    fn on_notification(&self, n: RpcNotification) {
        match n.notification.as_str() {
            api::CLIENT_CONNECTED => match serde_json::from_value::<ClientConnectedParams>(n.params) {
                Ok(p) => {
                    tracing::debug!(address = p.socket_address, client_uuid = %p.client_uuid, "tunnel client: client connected");
                    self.emit(ClientEvent::ClientConnected(RemoteClient {
                        address: p.socket_address,
                        client_uuid: p.client_uuid,
                        client_name: p.client_name,
                        peer_address: p.client_peer_address,
                    }));
                }
                Err(err) => tracing::warn!(err = %err, "tunnel client: malformed ClientConnected"),
            },
            api::CLIENT_DISCONNECTED => {
                match serde_json::from_value::<ClientDisconnectedParams>(n.params) {
                    Ok(p) => self.emit(ClientEvent::ClientDisconnected {
                        address: p.socket_address,
                    }),
                    Err(err) => tracing::warn!(err = %err, "tunnel client: malformed ClientDisconnected"),
                }
            }
            other => tracing::debug!(notification = %other, "tunnel client: unknown notification"),
        }
    }

    async fn run_client(
        &self,
        link: Link,
        cmds: &mut mpsc::UnboundedReceiver<Command>,
    ) -> anyhow::Result<Exit> {
        let Link {
            mut rd,
            mut wr,
            mut lines,
            ..
        } = link;
        let mut buf = vec![0u8; READ_BUFFER_BYTES];

        self.set_state(ClientState::RemoteConnected);
        let early = lines.take_remaining();
        if !early.is_empty() {
            self.emit(ClientEvent::RemoteData(early));
        }

        loop {
            tokio::select! {
                n = rd.read(&mut buf) => {
                    let n = n?;
                    if n == 0 {
                        anyhow::bail!("tunnel client: relay closed the connection");
                    }
                    self.emit(ClientEvent::RemoteData(Bytes::copy_from_slice(&buf[..n])));
                }
                cmd = cmds.recv() => match cmd {
                    Some(Command::Send(data)) => {
                        wr.write_all(&data).await?;
                        wr.flush().await?;
                    }
                    Some(Command::SendTo(..) | Command::DisconnectClient(_)) => {
                        self.emit(ClientEvent::Error(ClientError::WrongRole("server").to_string()));
                    }
                    Some(Command::Ping | Command::Connect | Command::Reconnect) => {}
                    Some(Command::Disconnect) => {
                        self.set_state(ClientState::Disconnecting);
                        let _ = wr.shutdown().await;
                        return Ok(Exit::Stopped);
                    }
                    None | Some(Command::Shutdown) => {
                        self.set_state(ClientState::Disconnecting);
                        let _ = wr.shutdown().await;
                        return Ok(Exit::Shutdown);
                    }
                },
            }
        }
    }
}

fn control_frame(id: i64, method: &str, params: Value) -> anyhow::Result<Bytes> {
    let body = rpc::encode_payload(&RpcRequest::new(id, method, params))?;
    Ok(slip::encode_frame(slip::CONTROL_ADDRESS, &body))
}

async fn read_reply(link: &mut Link, id: i64) -> anyhow::Result<RpcReply> {
    let mut buf = vec![0u8; 4096];
    loop {
        while let Some(line) = link.lines.next_line() {
            match rpc::parse_message(&line?)? {
                RpcMessage::Reply(r) if r.id == id => return Ok(r),
                other => tracing::debug!(message = ?other, "tunnel client: ignoring message before registration"),
            }
        }
        let n = link.rd.read(&mut buf).await?;
        if n == 0 {
            anyhow::bail!("tunnel client: relay closed the connection");
        }
        link.lines.feed(&buf[..n]);
    }
}
