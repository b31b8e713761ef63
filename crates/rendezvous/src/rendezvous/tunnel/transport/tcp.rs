use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};

use crate::rendezvous::net;
use crate::rendezvous::tunnel::transport::{
    BoxedStream, Incoming, Transport, TransportDialOptions, TransportListenOptions,
    TransportListener,
};

pub struct TcpTransport;

impl TcpTransport {
    pub fn new() -> Self {
        Self
    }
}

pub(crate) async fn bind(addr: &str) -> anyhow::Result<TcpListener> {
    let bind_addr = net::normalize_bind_addr(addr);
    Ok(TcpListener::bind(bind_addr.as_ref()).await?)
}

pub(crate) async fn connect(addr: &str) -> anyhow::Result<TcpStream> {
    let c = TcpStream::connect(addr).await?;
    let _ = c.set_nodelay(true);
    Ok(c)
}

#[async_trait]
impl Transport for TcpTransport {
    fn name(&self) -> &'static str {
        "tcp"
    }

    async fn listen(
        &self,
        addr: &str,
        _opts: TransportListenOptions,
    ) -> anyhow::Result<Box<dyn TransportListener>> {
        Ok(Box::new(TcpTransportListener { ln: bind(addr).await? }))
    }

    async fn dial(&self, addr: &str, _opts: TransportDialOptions) -> anyhow::Result<BoxedStream> {
        Ok(Box::new(connect(addr).await?))
    }
}

pub struct TcpTransportListener {
    ln: TcpListener,
}

#[async_trait]
impl TransportListener for TcpTransportListener {
    async fn accept(&self) -> anyhow::Result<Incoming> {
        let (c, peer) = self.ln.accept().await?;
        let _ = c.set_nodelay(true);
        Ok(Incoming::ready(Some(peer), Box::new(c)))
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.ln.local_addr().ok()
    }
}
