use std::{collections::VecDeque, fmt, net::SocketAddr, sync::Arc, time::Duration};

use bytes::Bytes;
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::{
        Semaphore, TryAcquireError,
        mpsc::{self, error::TrySendError},
        watch,
    },
};

/// Tunnel chunks a connection may have queued or held at once.
pub const TUNNEL_SLOTS: usize = 256;
/// Queue room kept free of tunnel data for replies and notifications.
const CONTROL_HEADROOM: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize)]
#[serde(transparent)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// One item of a connection's outbound queue.
#[derive(Debug)]
pub enum Outbound {
    /// Control-plane bytes; written as soon as they are dequeued.
    Control(Bytes),
    /// Tunnel bytes; held back until [`Outbound::OpenTunnel`] has been seen.
    /// Each one occupies a tunnel slot until it is written.
    Tunnel(Bytes),
    /// Control-channel frame ordered with tunnel bytes. Takes no tunnel slot.
    Frame(Bytes),
    /// Releases held tunnel bytes. Queued right after a successful
    /// registration reply so that reply always precedes tunnel traffic.
    OpenTunnel,
    Close,
}

struct Inner {
    id: ConnectionId,
    peer: Option<SocketAddr>,
    transport: &'static str,
    tx: mpsc::Sender<Outbound>,
    tunnel_slots: Semaphore,
    closed: watch::Sender<Option<Arc<str>>>,
}

/// Send/close capability for one physical connection.
///
/// Cloned into every relay table that references the connection. All writes
/// go through a single ordered, bounded queue drained by [`write_loop`].
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<Inner>,
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.inner.id)
            .field("peer", &self.inner.peer)
            .field("transport", &self.inner.transport)
            .finish_non_exhaustive()
    }
}

impl ConnectionHandle {
    pub fn new(
        id: ConnectionId,
        peer: Option<SocketAddr>,
        transport: &'static str,
    ) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(TUNNEL_SLOTS + CONTROL_HEADROOM);
        let (closed, _) = watch::channel(None);
        let h = Self {
            inner: Arc::new(Inner {
                id,
                peer,
                transport,
                tx,
                tunnel_slots: Semaphore::new(TUNNEL_SLOTS),
                closed,
            }),
        };
        (h, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.inner.peer
    }

    /// Peer address as announced to servers (`clientPeerAddress`).
    pub fn peer_address(&self) -> String {
        match self.inner.peer {
            Some(sa) => sa.ip().to_string(),
            None => "local".to_string(),
        }
    }

    pub fn transport(&self) -> &'static str {
        self.inner.transport
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.borrow().is_some()
    }

    pub fn send_control(&self, data: Bytes) -> bool {
        !self.is_closed() && self.enqueue(Outbound::Control(data))
    }

    pub fn send_frame(&self, data: Bytes) -> bool {
        !self.is_closed() && self.enqueue(Outbound::Frame(data))
    }

    /// Queues tunnel bytes without waiting. When every tunnel slot is taken
    /// the peer has stopped reading and the connection is closed.
    pub fn send_tunnel(&self, data: Bytes) -> bool {
        if self.is_closed() {
            return false;
        }
        match self.inner.tunnel_slots.try_acquire() {
            Ok(permit) => permit.forget(),
            Err(TryAcquireError::NoPermits) => {
                self.overflow();
                return false;
            }
            Err(TryAcquireError::Closed) => return false,
        }
        self.enqueue(Outbound::Tunnel(data))
    }

    /// Queues tunnel bytes, waiting for a free tunnel slot. Returns `false`
    /// once the connection is closed.
    pub async fn send_tunnel_wait(&self, data: Bytes) -> bool {
        if self.is_closed() {
            return false;
        }
        match self.inner.tunnel_slots.acquire().await {
            Ok(permit) => permit.forget(),
            Err(_) => return false,
        }
        self.enqueue(Outbound::Tunnel(data))
    }

    pub fn open_tunnel(&self) {
        self.enqueue(Outbound::OpenTunnel);
    }

    fn enqueue(&self, msg: Outbound) -> bool {
        match self.inner.tx.try_send(msg) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.overflow();
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    fn overflow(&self) {
        if self.close("backpressure") {
            metrics::counter!("rendezvous_backpressure_closes_total").increment(1);
            tracing::debug!(conn = %self.inner.id, "relay: outbound queue full");
        }
    }

    fn release_slot(&self) {
        self.inner.tunnel_slots.add_permits(1);
    }

    /// Marks the connection closed. Queued bytes are still flushed before the
    /// writer shuts the stream down. Returns `false` if it was already closed.
    pub fn close(&self, reason: &str) -> bool {
        let changed = self.inner.closed.send_if_modified(|v| {
            if v.is_some() {
                return false;
            }
            *v = Some(Arc::from(reason));
            true
        });
        if changed {
            self.inner.tunnel_slots.close();
            // A full queue is fine: the writer also watches the close flag.
            let _ = self.inner.tx.try_send(Outbound::Close);
        }
        changed
    }

    pub fn close_reason(&self) -> Option<Arc<str>> {
        self.inner.closed.borrow().clone()
    }

    /// Resolves once [`close`](Self::close) has been called, yielding the reason.
    pub async fn closed(&self) -> Arc<str> {
        let mut rx = self.inner.closed.subscribe();
        match rx.wait_for(|v| v.is_some()).await {
            Ok(v) => v.clone().unwrap_or_else(|| Arc::from("closed")),
            Err(_) => Arc::from("closed"),
        }
    }
}

/// Drains a connection's outbound queue into its write half.
pub async fn write_loop<W>(mut w: W, mut rx: mpsc::Receiver<Outbound>, handle: ConnectionHandle)
where
    W: AsyncWrite + Unpin,
{
    let mut gated = true;
    // (bytes, holds a tunnel slot)
    let mut held: VecDeque<(Bytes, bool)> = VecDeque::new();

    let res: std::io::Result<()> = async {
        loop {
            let msg = tokio::select! {
                biased;
                m = rx.recv() => match m {
                    Some(m) => m,
                    None => break,
                },
                _ = handle.closed() => break,
            };
            match msg {
                Outbound::Control(b) => w.write_all(&b).await?,
                Outbound::Tunnel(b) if gated => held.push_back((b, true)),
                Outbound::Frame(b) if gated => held.push_back((b, false)),
                Outbound::Tunnel(b) => {
                    w.write_all(&b).await?;
                    handle.release_slot();
                }
                Outbound::Frame(b) => w.write_all(&b).await?,
                Outbound::OpenTunnel => {
                    gated = false;
                    while let Some((b, slot)) = held.pop_front() {
                        w.write_all(&b).await?;
                        if slot {
                            handle.release_slot();
                        }
                    }
                }
                Outbound::Close => break,
            }
            if rx.is_empty() {
                w.flush().await?;
            }
        }
        w.flush().await
    }
    .await;

    if let Err(err) = res {
        tracing::debug!(conn = %handle.id(), err = %err, "relay: write failed");
        handle.close("write failed");
    }
    let _ = tokio::time::timeout(Duration::from_secs(1), w.shutdown()).await;
}
