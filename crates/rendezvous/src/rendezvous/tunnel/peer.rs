//! Ready-made peers on top of [`TunnelClient`]: `expose` publishes a local TCP
//! service through a relay, `forward` opens a local port that reaches one.

use std::{collections::HashMap, time::Duration};

use anyhow::Context;
use bytes::Bytes;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::{mpsc, watch},
    task::JoinHandle,
};
use uuid::Uuid;

use crate::rendezvous::{
    net,
    tunnel::client::{ClientEvent, ClientState, TunnelClient, TunnelClientOptions, TunnelRole},
};

const BRIDGE_BUFFER_BYTES: usize = 16 * 1024;

#[derive(Debug, Clone)]
pub struct ExposeOptions {
    /// Must carry a server role.
    pub tunnel: TunnelClientOptions,
    pub local_addr: String,
}

#[derive(Debug, Clone)]
pub struct ForwardOptions {
    /// Client role template; every accepted connection gets a fresh client uuid.
    pub tunnel: TunnelClientOptions,
    pub listen_addr: String,
}

/// Chunks queued toward one local connection before it counts as stalled.
const BRIDGE_QUEUE: usize = 64;

struct Bridge {
    id: u64,
    tx: mpsc::Sender<Bytes>,
    task: JoinHandle<()>,
}

/// Local connections of an exposing peer, keyed by remote client address.
struct BridgeSet {
    local_addr: String,
    bridges: HashMap<u16, Bridge>,
    next_id: u64,
    done: mpsc::UnboundedSender<(u16, u64)>,
}

impl BridgeSet {
    /// The receiver yields `(address, id)` for every bridge that ends on its own.
    fn new(local_addr: String) -> (Self, mpsc::UnboundedReceiver<(u16, u64)>) {
        let (done, done_rx) = mpsc::unbounded_channel();
        let set = Self {
            local_addr,
            bridges: HashMap::new(),
            next_id: 0,
            done,
        };
        (set, done_rx)
    }

    fn len(&self) -> usize {
        self.bridges.len()
    }

    fn open(&mut self, client: &TunnelClient, address: u16) {
        self.next_id += 1;
        let (tx, rx) = mpsc::channel(BRIDGE_QUEUE);
        let task = tokio::spawn(bridge_local(
            client.clone(),
            address,
            self.next_id,
            self.local_addr.clone(),
            rx,
            self.done.clone(),
        ));
        let bridge = Bridge {
            id: self.next_id,
            tx,
            task,
        };
        if let Some(old) = self.bridges.insert(address, bridge) {
            old.task.abort();
        }
    }

    /// Addresses restart after a reconnect, so only the bridge that ended is dropped.
    fn finished(&mut self, address: u16, id: u64) {
        if self.bridges.get(&address).is_some_and(|b| b.id == id) {
            self.bridges.remove(&address);
        }
    }

    /// Returns `false` when the local side has stopped draining; the bridge is
    /// dropped and the caller should disconnect the remote client.
    fn feed(&mut self, address: u16, payload: Bytes) -> bool {
        let Some(b) = self.bridges.get(&address) else {
            return true;
        };
        match b.tx.try_send(payload) {
            Ok(()) | Err(mpsc::error::TrySendError::Closed(_)) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.close(address);
                false
            }
        }
    }

    fn close(&mut self, address: u16) {
        if let Some(b) = self.bridges.remove(&address) {
            b.task.abort();
        }
    }

    fn clear(&mut self) {
        for (_, b) in self.bridges.drain() {
            b.task.abort();
        }
    }
}

/// Registers as a server and bridges every announced client to a new TCP
/// connection to `local_addr`.
pub async fn run_expose(opts: ExposeOptions, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    if !opts.tunnel.role.is_server() {
        anyhow::bail!("peer: expose needs a server role");
    }
    let uuid = opts.tunnel.role.uuid();
    let (client, mut events) = TunnelClient::spawn(opts.tunnel.clone());
    client.connect()?;
    tracing::info!(relay = %opts.tunnel.relay_addr, server_uuid = %uuid, local = %opts.local_addr, "peer: exposing");

    let (mut bridges, mut finished) = BridgeSet::new(opts.local_addr.clone());
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            Some((address, id)) = finished.recv() => bridges.finished(address, id),
            ev = events.recv() => {
                let Some(ev) = ev else { break };
                match ev {
                    ClientEvent::ClientConnected(rc) => {
                        tracing::debug!(address = rc.address, client = %rc.client_name, peer = %rc.peer_address, "peer: remote client");
                        metrics::counter!("rendezvous_peer_streams_total", "mode" => "expose").increment(1);
                        bridges.open(&client, rc.address);
                    }
                    ClientEvent::Data { address, payload } => {
                        if !bridges.feed(address, payload) {
                            tracing::debug!(address, local = %opts.local_addr, "peer: local side stalled, dropping remote client");
                            let _ = client.disconnect_client(address);
                        }
                    }
                    ClientEvent::ClientDisconnected { address } => bridges.close(address),
                    ClientEvent::StateChanged(ClientState::Disconnected) => bridges.clear(),
                    ClientEvent::Error(msg) => {
                        tracing::warn!(relay = %opts.tunnel.relay_addr, server_uuid = %uuid, err = %msg, "peer: tunnel error");
                    }
                    _ => {}
                }
            }
        }
        metrics::gauge!("rendezvous_peer_bridges").set(bridges.len() as f64);
    }

    bridges.clear();
    client.shutdown();
    Ok(())
}

async fn bridge_local(
    client: TunnelClient,
    address: u16,
    id: u64,
    local_addr: String,
    inbound: mpsc::Receiver<Bytes>,
    done: mpsc::UnboundedSender<(u16, u64)>,
) {
    pump_local(&client, address, &local_addr, inbound).await;
    let _ = client.disconnect_client(address);
    let _ = done.send((address, id));
}

async fn pump_local(
    client: &TunnelClient,
    address: u16,
    local_addr: &str,
    mut inbound: mpsc::Receiver<Bytes>,
) {
    let stream = match TcpStream::connect(local_addr).await {
        Ok(s) => s,
        Err(err) => {
            tracing::warn!(address, local = %local_addr, err = %err, "peer: local dial failed");
            return;
        }
    };
    let _ = stream.set_nodelay(true);
    let (mut rd, mut wr) = stream.into_split();
    let mut buf = vec![0u8; BRIDGE_BUFFER_BYTES];

    loop {
        tokio::select! {
            n = rd.read(&mut buf) => {
                match n {
                    Ok(n) if n > 0 => {
                        if client.send_to(address, Bytes::copy_from_slice(&buf[..n])).is_err() {
                            return;
                        }
                    }
                    _ => return,
                }
            }
            data = inbound.recv() => {
                let Some(data) = data else { return };
                if wr.write_all(&data).await.is_err() {
                    return;
                }
            }
        }
    }
}

pub async fn bind_forward(listen_addr: &str) -> anyhow::Result<TcpListener> {
    let bind_addr = net::normalize_bind_addr(listen_addr);
    TcpListener::bind(bind_addr.as_ref())
        .await
        .with_context(|| format!("peer: forward bind {listen_addr}"))
}

pub async fn forward(opts: ForwardOptions, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    let ln = bind_forward(&opts.listen_addr).await?;
    run_forward(ln, opts, shutdown).await
}

/// Accepts local connections and carries each one over its own client-role
/// tunnel connection.
pub async fn run_forward(
    ln: TcpListener,
    opts: ForwardOptions,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let TunnelRole::Client { server_uuid, .. } = &opts.tunnel.role else {
        anyhow::bail!("peer: forward needs a client role");
    };
    tracing::info!(listen = %opts.listen_addr, local = ?ln.local_addr().ok(), relay = %opts.tunnel.relay_addr, server_uuid = %server_uuid, "peer: forwarding");

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            res = ln.accept() => {
                let (c, peer) = match res {
                    Ok(v) => v,
                    Err(err) => {
                        tracing::warn!(err = %err, "peer: accept failed");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        continue;
                    }
                };
                let tunnel = per_connection(&opts.tunnel);
                tokio::spawn(async move {
                    metrics::counter!("rendezvous_peer_streams_total", "mode" => "forward").increment(1);
                    if let Err(err) = forward_one(c, tunnel).await {
                        tracing::debug!(peer = %peer, err = %err, "peer: forward ended");
                    }
                });
            }
        }
    }
    Ok(())
}

fn per_connection(template: &TunnelClientOptions) -> TunnelClientOptions {
    let mut opts = template.clone();
    if let TunnelRole::Client { client_uuid, .. } = &mut opts.role {
        *client_uuid = Uuid::new_v4();
    }
    opts.auto_reconnect = false;
    opts
}

async fn forward_one(mut c: TcpStream, opts: TunnelClientOptions) -> anyhow::Result<()> {
    let _ = c.set_nodelay(true);
    let limit = opts.connect_timeout + opts.call_timeout * 4;
    let (client, mut events) = TunnelClient::spawn(opts);
    client.connect()?;

    let ready = tokio::time::timeout(limit, async {
        loop {
            match events.recv().await {
                Some(ClientEvent::StateChanged(ClientState::RemoteConnected)) => return Ok(()),
                Some(ClientEvent::Error(msg)) => anyhow::bail!("peer: {msg}"),
                Some(_) => {}
                None => anyhow::bail!("peer: tunnel client stopped"),
            }
        }
    })
    .await
    .context("peer: tunnel setup timed out");
    match ready {
        Ok(Ok(())) => {}
        Ok(Err(err)) | Err(err) => {
            client.shutdown();
            return Err(err);
        }
    }

    let res = pipe(&mut c, &client, &mut events).await;
    client.shutdown();
    let _ = c.shutdown().await;
    res
}

async fn pipe(
    c: &mut TcpStream,
    client: &TunnelClient,
    events: &mut mpsc::UnboundedReceiver<ClientEvent>,
) -> anyhow::Result<()> {
    let (mut rd, mut wr) = c.split();
    let mut buf = vec![0u8; BRIDGE_BUFFER_BYTES];
    loop {
        tokio::select! {
            n = rd.read(&mut buf) => {
                let n = n?;
                if n == 0 {
                    return Ok(());
                }
                client.send(Bytes::copy_from_slice(&buf[..n]))?;
            }
            ev = events.recv() => match ev {
                Some(ClientEvent::RemoteData(data)) => wr.write_all(&data).await?,
                Some(ClientEvent::StateChanged(ClientState::Disconnected)) | None => return Ok(()),
                Some(_) => {}
            },
        }
    }
}
