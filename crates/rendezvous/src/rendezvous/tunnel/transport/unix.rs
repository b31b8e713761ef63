use std::{net::SocketAddr, path::PathBuf};

use async_trait::async_trait;
use tokio::net::{UnixListener, UnixStream};

use crate::rendezvous::tunnel::transport::{
    BoxedStream, Incoming, Transport, TransportDialOptions, TransportListenOptions,
    TransportListener,
};

/// Local socket transport. Addresses are filesystem paths.
pub struct UnixTransport;

impl UnixTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for UnixTransport {
    fn name(&self) -> &'static str {
        "unix"
    }

    fn uses_host_lookup(&self) -> bool {
        false
    }

    async fn listen(
        &self,
        addr: &str,
        _opts: TransportListenOptions,
    ) -> anyhow::Result<Box<dyn TransportListener>> {
        let path = PathBuf::from(addr.trim());
        // A stale socket file from an earlier run blocks bind.
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        let ln = UnixListener::bind(&path)?;
        Ok(Box::new(UnixTransportListener { ln, path }))
    }

    async fn dial(&self, addr: &str, _opts: TransportDialOptions) -> anyhow::Result<BoxedStream> {
        Ok(Box::new(UnixStream::connect(addr.trim()).await?))
    }
}

pub struct UnixTransportListener {
    ln: UnixListener,
    path: PathBuf,
}

#[async_trait]
impl TransportListener for UnixTransportListener {
    async fn accept(&self) -> anyhow::Result<Incoming> {
        let (c, _) = self.ln.accept().await?;
        Ok(Incoming::ready(None, Box::new(c)))
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }
}

impl Drop for UnixTransportListener {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn dial_and_accept_over_socket_file() {
        let path = std::env::temp_dir().join(format!("rendezvous-test-{}.sock", std::process::id()));
        let addr = path.to_string_lossy().to_string();
        let tr = UnixTransport::new();
        let ln = tr.listen(&addr, Default::default()).await.unwrap();

        let a2 = addr.clone();
        let dial = tokio::spawn(async move {
            let mut c = UnixTransport::new().dial(&a2, Default::default()).await.unwrap();
            c.write_all(b"local").await.unwrap();
            c.shutdown().await.unwrap();
        });

        let inc = ln.accept().await.unwrap();
        assert!(inc.peer.is_none());
        let mut s = inc.upgrade.await.unwrap();
        let mut got = Vec::new();
        s.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"local");
        dial.await.unwrap();
        drop(ln);
        assert!(!path.exists());
    }
}
