//! Relay side of one physical connection.
//!
//! ```text
//! Connected -> AwaitingHello -> Ready -> Registered(Server) -> Multiplexing
//!                                     -> Registered(Client) -> Relaying
//! (any) -> Disconnected
//! ```
//!
//! Before registration the stream carries newline-terminated JSON. After
//! `RegisterServer` it carries SLIP frames; after `RegisterClient` it is an
//! opaque byte pipe.

use std::{fmt, net::SocketAddr, sync::Arc, time::Duration};

use serde::Serialize;
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    time::Instant,
};

use crate::rendezvous::{
    telemetry::{self, ConnectionInfo},
    tunnel::{
        dispatcher::{Action, Binding, ControlContext},
        handle::{self, ConnectionHandle},
        relay::Relay,
        rpc::{self, LineBuffer, RpcReply},
        slip::{self, SlipDecoder},
        transport::BoxedStream,
    },
};

const READ_BUFFER_BYTES: usize = 32 * 1024;
const WRITER_DRAIN: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerRole {
    Server,
    Client,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Connected,
    AwaitingHello,
    Ready,
    Registered(PeerRole),
    Multiplexing,
    Relaying,
    Disconnected,
}

impl RelayState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelayState::Connected => "connected",
            RelayState::AwaitingHello => "awaiting_hello",
            RelayState::Ready => "ready",
            RelayState::Registered(PeerRole::Server) => "registered_server",
            RelayState::Registered(PeerRole::Client) => "registered_client",
            RelayState::Multiplexing => "multiplexing",
            RelayState::Relaying => "relaying",
            RelayState::Disconnected => "disconnected",
        }
    }

    pub fn is_registered(&self) -> bool {
        matches!(
            self,
            RelayState::Registered(_) | RelayState::Multiplexing | RelayState::Relaying
        )
    }

    pub fn can_advance_to(&self, next: RelayState) -> bool {
        use RelayState::*;
        match (*self, next) {
            (Disconnected, _) => false,
            (_, Disconnected) => true,
            (Connected, AwaitingHello) | (AwaitingHello, Ready) | (Ready, Registered(_)) => true,
            (Registered(PeerRole::Server), Multiplexing) => true,
            (Registered(PeerRole::Client), Relaying) => true,
            _ => false,
        }
    }
}

impl fmt::Display for RelayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
enum End {
    Eof,
    Closed(Arc<str>),
    HandshakeTimeout,
    IdleTimeout,
    Rejected(String),
    Violation(String),
    Io(std::io::Error),
}

impl fmt::Display for End {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            End::Eof => f.write_str("peer closed"),
            End::Closed(r) => f.write_str(r),
            End::HandshakeTimeout => f.write_str("handshake timeout"),
            End::IdleTimeout => f.write_str("idle timeout"),
            End::Rejected(r) => f.write_str(r),
            End::Violation(r) => write!(f, "protocol violation: {r}"),
            End::Io(e) => write!(f, "read failed: {e}"),
        }
    }
}

struct RelayConnection {
    relay: Arc<Relay>,
    ctx: ControlContext,
    lines: LineBuffer,
    slip: SlipDecoder,
    reported: RelayState,
}

pub(crate) async fn serve(
    relay: Arc<Relay>,
    stream: BoxedStream,
    peer: Option<SocketAddr>,
    transport: &'static str,
) {
    let id = relay.manager().next_connection_id();
    let (handle, rx) = ConnectionHandle::new(id, peer, transport);
    let (rd, wr) = tokio::io::split(stream);
    let mut writer = tokio::spawn(handle::write_loop(wr, rx, handle.clone()));

    metrics::counter!("rendezvous_connections_total", "transport" => transport).increment(1);
    metrics::gauge!("rendezvous_active_connections").increment(1.0);
    relay.connections().add(ConnectionInfo {
        id,
        peer: peer.map(|p| p.to_string()).unwrap_or_else(|| "local".into()),
        transport,
        state: RelayState::Connected.as_str(),
        server_uuid: None,
        address: None,
        started_at_unix_ms: telemetry::now_unix_ms(),
    });
    tracing::debug!(conn = %id, peer = ?peer, transport, "relay: connection accepted");

    let mut conn = RelayConnection {
        relay: relay.clone(),
        ctx: ControlContext::new(handle),
        lines: LineBuffer::new(),
        slip: SlipDecoder::new(),
        reported: RelayState::Connected,
    };
    conn.advance(RelayState::AwaitingHello);
    let end = conn.read_loop(rd).await;
    match &end {
        End::Violation(_) | End::Io(_) => {
            tracing::warn!(conn = %id, state = %conn.ctx.state, reason = %end, "relay: connection closed")
        }
        _ => {
            tracing::debug!(conn = %id, state = %conn.ctx.state, reason = %end, "relay: connection closed")
        }
    }
    conn.finish(&end).await;

    if tokio::time::timeout(WRITER_DRAIN, &mut writer).await.is_err() {
        writer.abort();
    }
    relay.connections().remove(id);
    metrics::gauge!("rendezvous_active_connections").decrement(1.0);
}

async fn read_with_deadline<R>(
    rd: &mut R,
    buf: &mut [u8],
    deadline: Option<Instant>,
) -> std::io::Result<Option<usize>>
where
    R: AsyncRead + Unpin,
{
    match deadline {
        Some(d) => match tokio::time::timeout_at(d, rd.read(buf)).await {
            Ok(r) => r.map(Some),
            Err(_) => Ok(None),
        },
        None => rd.read(buf).await.map(Some),
    }
}

impl RelayConnection {
    async fn read_loop<R>(&mut self, mut rd: R) -> End
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = vec![0u8; READ_BUFFER_BYTES];
        let handshake_deadline = Instant::now() + self.relay.options().handshake_timeout;
        let handle = self.ctx.handle.clone();

        loop {
            let registered = self.ctx.state.is_registered();
            let deadline = if registered {
                self.relay.options().idle_timeout.map(|d| Instant::now() + d)
            } else {
                Some(handshake_deadline)
            };
            let read = tokio::select! {
                reason = handle.closed() => return End::Closed(reason),
                r = read_with_deadline(&mut rd, &mut buf, deadline) => r,
            };
            let n = match read {
                Ok(Some(0)) => return End::Eof,
                Ok(Some(n)) => n,
                Ok(None) if registered => return End::IdleTimeout,
                Ok(None) => return End::HandshakeTimeout,
                Err(e) => return End::Io(e),
            };
            if let Err(end) = self.on_bytes(&buf[..n]).await {
                return end;
            }
        }
    }

    async fn on_bytes(&mut self, chunk: &[u8]) -> Result<(), End> {
        match self.ctx.state {
            RelayState::Multiplexing => self.on_frames(chunk).await,
            RelayState::Relaying => {
                self.relay_to_server(chunk).await;
                Ok(())
            }
            _ => {
                self.lines.feed(chunk);
                self.on_lines().await
            }
        }
    }

    async fn on_lines(&mut self) -> Result<(), End> {
        while let Some(line) = self.lines.next_line() {
            let line = match line {
                Ok(l) => l,
                Err(err) => {
                    metrics::counter!("rendezvous_protocol_violations_total").increment(1);
                    self.reply_line(&RpcReply::error(rpc::UNKNOWN_ID, err.to_string()));
                    return Err(End::Violation(err.to_string()));
                }
            };
            let d = self
                .relay
                .dispatcher()
                .dispatch(&mut self.ctx, &line)
                .await;
            self.reply_line(&d.reply);
            self.sync_state();

            match d.action {
                Action::None => {}
                Action::Close(reason) => return Err(End::Rejected(reason)),
                Action::EnterMultiplexing => {
                    self.ctx.handle.open_tunnel();
                    self.advance(RelayState::Multiplexing);
                    let rest = self.lines.take_remaining();
                    if rest.is_empty() {
                        return Ok(());
                    }
                    return self.on_frames(&rest).await;
                }
                Action::EnterRelaying => {
                    self.ctx.handle.open_tunnel();
                    self.advance(RelayState::Relaying);
                    let rest = self.lines.take_remaining();
                    self.relay_to_server(&rest).await;
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    async fn on_frames(&mut self, chunk: &[u8]) -> Result<(), End> {
        let Some(Binding::Server(session)) = self.ctx.binding.clone() else {
            return Err(End::Violation("multiplexing without a session".into()));
        };
        self.slip.feed(chunk);
        while let Some(frame) = self.slip.next_frame() {
            let frame = match frame {
                Ok(f) => f,
                Err(err) => {
                    metrics::counter!("rendezvous_protocol_violations_total").increment(1);
                    return Err(End::Violation(format!("bad frame: {err}")));
                }
            };
            metrics::counter!("rendezvous_frames_total", "direction" => "inbound").increment(1);

            if frame.is_control() {
                let d = self
                    .relay
                    .dispatcher()
                    .dispatch(&mut self.ctx, &frame.payload)
                    .await;
                match rpc::encode_payload(&d.reply) {
                    Ok(body) => {
                        session.send_control(&body);
                    }
                    Err(err) => {
                        tracing::warn!(conn = %self.ctx.handle.id(), err = %err, "relay: encode reply")
                    }
                }
                if let Action::Close(reason) = d.action {
                    return Err(End::Rejected(reason));
                }
                continue;
            }

            if frame.address == slip::INVALID_ADDRESS
                || !session.route_to_client(frame.address, frame.payload)
            {
                tracing::debug!(
                    conn = %self.ctx.handle.id(),
                    address = frame.address,
                    "relay: frame for unbound address dropped"
                );
            }
        }
        Ok(())
    }

    /// Stops reading from this client until the server's queue has room.
    async fn relay_to_server(&self, chunk: &[u8]) {
        if chunk.is_empty() {
            return;
        }
        if let Some(Binding::Client { session, address }) = &self.ctx.binding {
            let sent = tokio::select! {
                ok = session.route_to_server(*address, chunk) => ok,
                _ = self.ctx.handle.closed() => false,
            };
            if sent {
                metrics::counter!("rendezvous_frames_total", "direction" => "outbound").increment(1);
            }
        }
    }

    fn reply_line(&self, reply: &RpcReply) {
        match rpc::encode_line(reply) {
            Ok(b) => {
                self.ctx.handle.send_control(b);
            }
            Err(err) => {
                tracing::warn!(conn = %self.ctx.handle.id(), err = %err, "relay: encode reply")
            }
        }
    }

    fn advance(&mut self, next: RelayState) {
        if !self.ctx.state.can_advance_to(next) {
            tracing::warn!(conn = %self.ctx.handle.id(), from = %self.ctx.state, to = %next, "relay: invalid state transition");
            return;
        }
        self.ctx.state = next;
        self.sync_state();
    }

    fn sync_state(&mut self) {
        let state = self.ctx.state;
        if state == self.reported {
            return;
        }
        tracing::trace!(conn = %self.ctx.handle.id(), from = %self.reported, to = %state, "relay: state");
        self.reported = state;
        let (server_uuid, address) = match &self.ctx.binding {
            Some(Binding::Server(s)) => (Some(s.server_uuid()), None),
            Some(Binding::Client { session, address }) => {
                (Some(session.server_uuid()), Some(*address))
            }
            None => (None, None),
        };
        self.relay.connections().update(self.ctx.handle.id(), |c| {
            c.state = state.as_str();
            c.server_uuid = server_uuid;
            c.address = address;
        });
    }

    async fn finish(&mut self, end: &End) {
        self.ctx.handle.close(&end.to_string());
        match self.ctx.binding.take() {
            Some(Binding::Server(session)) => {
                self.relay.manager().server_disconnected(&session).await
            }
            Some(Binding::Client { session, .. }) => {
                self.relay
                    .manager()
                    .client_disconnected(&session, self.ctx.handle.id())
                    .await
            }
            None => {}
        }
        self.advance(RelayState::Disconnected);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rendezvous::tunnel::{
        auth::MockAuthenticator,
        relay::RelayOptions,
        rpc::{RpcMessage, RpcRequest},
        slip::Frame,
    };
    use bytes::Bytes;
    use serde_json::{Value, json};
    use tokio::io::{AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
    use uuid::Uuid;

    struct Peer {
        rd: ReadHalf<DuplexStream>,
        wr: WriteHalf<DuplexStream>,
        lines: LineBuffer,
        slip: SlipDecoder,
        next_id: i64,
    }

    impl Peer {
        fn attach(relay: &Arc<Relay>) -> Self {
            let (near, far) = tokio::io::duplex(64 * 1024);
            let r = relay.clone();
            tokio::spawn(async move { r.serve_connection(Box::new(far), Some("198.51.100.7:4000".parse().unwrap()), "test").await });
            let (rd, wr) = tokio::io::split(near);
            Self {
                rd,
                wr,
                lines: LineBuffer::new(),
                slip: SlipDecoder::new(),
                next_id: 1,
            }
        }

        async fn fill(&mut self) -> usize {
            let mut buf = [0u8; 4096];
            let n = self.rd.read(&mut buf).await.unwrap();
            self.lines.feed(&buf[..n]);
            self.slip.feed(&buf[..n]);
            n
        }

        async fn call(&mut self, method: &str, params: Value) -> Value {
            let id = self.next_id;
            self.next_id += 1;
            let line = rpc::encode_line(&RpcRequest::new(id, method, params)).unwrap();
            self.wr.write_all(&line).await.unwrap();
            loop {
                if let Some(l) = self.lines.next_line() {
                    let v: Value = serde_json::from_slice(&l.unwrap()).unwrap();
                    assert_eq!(v["id"], id);
                    // The remainder after the reply belongs to the next layer.
                    let rest = self.lines.take_remaining();
                    self.slip = SlipDecoder::new();
                    self.slip.feed(&rest);
                    self.lines.feed(&rest);
                    return v;
                }
                assert!(self.fill().await > 0, "relay closed during {method}");
            }
        }

        async fn frame(&mut self) -> Frame {
            loop {
                if let Some(f) = self.slip.next_frame() {
                    return f.unwrap();
                }
                assert!(self.fill().await > 0, "relay closed while waiting for a frame");
            }
        }

        async fn raw(&mut self, len: usize) -> Vec<u8> {
            let mut out = self.lines.take_remaining().to_vec();
            while out.len() < len {
                let mut buf = [0u8; 4096];
                let n = self.rd.read(&mut buf).await.unwrap();
                assert!(n > 0);
                out.extend_from_slice(&buf[..n]);
            }
            out
        }

        async fn eof(&mut self) -> bool {
            let mut buf = [0u8; 4096];
            loop {
                match self.rd.read(&mut buf).await {
                    Ok(0) | Err(_) => return true,
                    Ok(_) => continue,
                }
            }
        }
    }

    fn relay() -> Arc<Relay> {
        Relay::new(RelayOptions::default(), None)
    }

    async fn server(relay: &Arc<Relay>, uuid: Uuid) -> Peer {
        let mut s = Peer::attach(relay);
        s.call("RemoteProxy.Hello", json!({})).await;
        let r = s
            .call("TunnelProxy.RegisterServer", json!({"serverName": "srv", "serverUuid": uuid.to_string()}))
            .await;
        assert_eq!(r["params"]["tunnelProxyError"], "TunnelProxyErrorNoError");
        assert_eq!(r["params"]["slipEnabled"], true);
        s
    }

    async fn client(relay: &Arc<Relay>, server_uuid: Uuid) -> Peer {
        let mut c = Peer::attach(relay);
        c.call("RemoteProxy.Hello", json!({})).await;
        let r = c
            .call(
                "TunnelProxy.RegisterClient",
                json!({"clientName": "cli", "clientUuid": Uuid::new_v4().to_string(), "serverUuid": server_uuid.to_string()}),
            )
            .await;
        assert_eq!(r["params"]["tunnelProxyError"], "TunnelProxyErrorNoError");
        c
    }

    fn notification(f: &Frame) -> (String, Value) {
        assert!(f.is_control());
        match rpc::parse_message(&f.payload).unwrap() {
            RpcMessage::Notification(n) => (n.notification, n.params),
            other => panic!("expected notification, got {other:?}"),
        }
    }

    #[test]
    fn state_transitions_follow_the_handshake() {
        use RelayState::*;
        assert!(Connected.can_advance_to(AwaitingHello));
        assert!(Ready.can_advance_to(Registered(PeerRole::Client)));
        assert!(Registered(PeerRole::Server).can_advance_to(Multiplexing));
        assert!(!Registered(PeerRole::Server).can_advance_to(Relaying));
        assert!(!AwaitingHello.can_advance_to(Multiplexing));
        assert!(Relaying.can_advance_to(Disconnected));
        assert!(!Disconnected.can_advance_to(Disconnected));
    }

    #[tokio::test]
    async fn end_to_end_server_and_client() {
        let relay = relay();
        let u = Uuid::new_v4();
        let mut s = server(&relay, u).await;
        let mut c = client(&relay, u).await;

        let (name, params) = notification(&s.frame().await);
        assert_eq!(name, "TunnelProxy.ClientConnected");
        assert_eq!(params["socketAddress"], 1);
        assert_eq!(params["clientName"], "cli");
        assert_eq!(params["clientPeerAddress"], "198.51.100.7");

        c.wr.write_all(b"hello").await.unwrap();
        let mut up = Vec::new();
        while up.len() < 5 {
            let f = s.frame().await;
            assert_eq!(f.address, 1);
            up.extend_from_slice(&f.payload);
        }
        assert_eq!(up, b"hello");

        s.wr.write_all(&slip::encode_frame(1, b"world")).await.unwrap();
        assert_eq!(c.raw(5).await, b"world");

        // Control calls keep working inside frames.
        let ping = rpc::encode_payload(&RpcRequest::new(9, "TunnelProxy.Ping", json!({"timestamp": 42}))).unwrap();
        s.wr.write_all(&slip::encode_frame(0, &ping)).await.unwrap();
        let f = s.frame().await;
        match rpc::parse_message(&f.payload).unwrap() {
            RpcMessage::Reply(r) => {
                assert_eq!(r.id, 9);
                assert_eq!(r.params.unwrap()["timestamp"], 42);
            }
            other => panic!("expected reply, got {other:?}"),
        }

        drop(c);
        let (name, params) = notification(&s.frame().await);
        assert_eq!(name, "TunnelProxy.ClientDisconnected");
        assert_eq!(params["socketAddress"], 1);
    }

    #[tokio::test]
    async fn server_loss_disconnects_clients() {
        let relay = relay();
        let u = Uuid::new_v4();
        let s = server(&relay, u).await;
        let mut c1 = client(&relay, u).await;
        let mut c2 = client(&relay, u).await;
        drop(s);
        assert!(c1.eof().await);
        assert!(c2.eof().await);

        // The uuid is free again.
        let _s2 = server(&relay, u).await;
    }

    #[tokio::test]
    async fn disconnect_client_closes_without_notification() {
        let relay = relay();
        let u = Uuid::new_v4();
        let mut s = server(&relay, u).await;
        let mut c = client(&relay, u).await;
        notification(&s.frame().await);

        let req = rpc::encode_payload(&RpcRequest::new(3, "TunnelProxy.DisconnectClient", json!({"socketAddress": 1}))).unwrap();
        s.wr.write_all(&slip::encode_frame(0, &req)).await.unwrap();
        match rpc::parse_message(&s.frame().await.payload).unwrap() {
            RpcMessage::Reply(r) => assert_eq!(r.params.unwrap()["tunnelProxyError"], "TunnelProxyErrorNoError"),
            other => panic!("expected reply, got {other:?}"),
        }
        assert!(c.eof().await);

        // Nothing else arrives on the control channel; the next frame is a ping reply.
        let ping = rpc::encode_payload(&RpcRequest::new(4, "TunnelProxy.Ping", json!({"timestamp": 1}))).unwrap();
        s.wr.write_all(&slip::encode_frame(0, &ping)).await.unwrap();
        assert!(matches!(rpc::parse_message(&s.frame().await.payload).unwrap(), RpcMessage::Reply(r) if r.id == 4));
    }

    #[tokio::test]
    async fn bytes_after_register_client_are_relayed() {
        let relay = relay();
        let u = Uuid::new_v4();
        let mut s = server(&relay, u).await;

        let mut c = Peer::attach(&relay);
        c.call("RemoteProxy.Hello", json!({})).await;
        let mut line = rpc::encode_line(&RpcRequest::new(
            2,
            "TunnelProxy.RegisterClient",
            json!({"clientName": "eager", "clientUuid": Uuid::new_v4().to_string(), "serverUuid": u.to_string()}),
        ))
        .unwrap()
        .to_vec();
        line.extend_from_slice(b"early");
        c.wr.write_all(&line).await.unwrap();

        let (name, _) = notification(&s.frame().await);
        assert_eq!(name, "TunnelProxy.ClientConnected");
        assert_eq!(s.frame().await, Frame::new(1, Bytes::from_static(b"early")));
    }

    #[tokio::test]
    async fn garbage_gets_error_reply_then_close() {
        let relay = relay();
        let mut p = Peer::attach(&relay);
        p.wr.write_all(b"this is not json\n").await.unwrap();
        p.fill().await;
        let l = p.lines.next_line().unwrap().unwrap();
        let v: Value = serde_json::from_slice(&l).unwrap();
        assert_eq!(v["id"], -1);
        assert_eq!(v["status"], "error");
        assert!(p.eof().await);
    }

    #[tokio::test]
    async fn unauthenticated_registration_is_refused() {
        let relay = Relay::new(RelayOptions::default(), Some(Arc::new(MockAuthenticator::accepting())));
        let mut p = Peer::attach(&relay);
        p.call("RemoteProxy.Hello", json!({})).await;
        let r = p
            .call("TunnelProxy.RegisterServer", json!({"serverName": "s", "serverUuid": Uuid::new_v4().to_string()}))
            .await;
        assert_eq!(r["params"]["tunnelProxyError"], "TunnelProxyErrorNotAuthenticated");
        assert!(p.eof().await);
        assert_eq!(relay.manager().session_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_hits_handshake_timeout() {
        let relay = relay();
        let mut p = Peer::attach(&relay);
        let started = Instant::now();
        assert!(p.eof().await);
        assert!(started.elapsed() >= RelayOptions::default().handshake_timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn quiet_registered_peer_hits_idle_timeout() {
        let idle = Duration::from_secs(30);
        let relay = Relay::new(
            RelayOptions {
                idle_timeout: Some(idle),
                ..RelayOptions::default()
            },
            None,
        );
        let u = Uuid::new_v4();
        let mut s = server(&relay, u).await;

        // Traffic inside the window keeps the connection open.
        tokio::time::sleep(Duration::from_secs(20)).await;
        let ping = rpc::encode_payload(&RpcRequest::new(9, "TunnelProxy.Ping", json!({"timestamp": 1}))).unwrap();
        s.wr.write_all(&slip::encode_frame(0, &ping)).await.unwrap();
        assert!(matches!(rpc::parse_message(&s.frame().await.payload).unwrap(), RpcMessage::Reply(r) if r.id == 9));
        let last = Instant::now();
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(relay.manager().lookup(&u).await.is_some());

        assert!(s.eof().await);
        assert!(last.elapsed() >= idle);
        while relay.manager().lookup(&u).await.is_some() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn registered_peer_without_idle_timeout_stays_open() {
        let relay = relay();
        let u = Uuid::new_v4();
        let mut s = server(&relay, u).await;
        let quiet = RelayOptions::default().handshake_timeout * 6;
        assert!(tokio::time::timeout(quiet, s.eof()).await.is_err());
        assert!(relay.manager().lookup(&u).await.is_some());
    }

    #[tokio::test]
    async fn server_cannot_register_as_client_on_the_same_connection() {
        let relay = relay();
        let mut p = Peer::attach(&relay);
        p.call("RemoteProxy.Hello", json!({})).await;
        let u = Uuid::new_v4();
        p.call("TunnelProxy.RegisterServer", json!({"serverName": "srv", "serverUuid": u.to_string()}))
            .await;

        let req = rpc::encode_payload(&RpcRequest::new(
            5,
            "TunnelProxy.RegisterClient",
            json!({"clientName": "c", "clientUuid": Uuid::new_v4().to_string(), "serverUuid": u.to_string()}),
        ))
        .unwrap();
        p.wr.write_all(&slip::encode_frame(0, &req)).await.unwrap();
        match rpc::parse_message(&p.frame().await.payload).unwrap() {
            RpcMessage::Reply(r) => {
                assert_eq!(r.id, 5);
                assert_eq!(r.params.unwrap()["tunnelProxyError"], "TunnelProxyErrorAlreadyRegistered");
            }
            other => panic!("expected reply, got {other:?}"),
        }
        assert!(p.eof().await);
    }

    #[tokio::test]
    async fn admin_view_tracks_connection_state() {
        let relay = relay();
        let u = Uuid::new_v4();
        let _s = server(&relay, u).await;
        let snap = relay.connections().snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].state, "multiplexing");
        assert_eq!(snap[0].server_uuid, Some(u));
    }
}
