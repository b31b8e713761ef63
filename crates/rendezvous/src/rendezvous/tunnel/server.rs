use std::{net::SocketAddr, sync::Arc};

use crate::rendezvous::tunnel::{
    relay::Relay,
    transport::{TlsListenOptions, TransportListenOptions, TransportListener, transport_by_name},
};

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub listen_addr: String,
    pub transport: String,
    pub tls: TlsListenOptions,
    pub relay: Arc<Relay>,
}

/// One listening endpoint of the relay.
pub struct Server {
    opts: ServerOptions,
}

impl Server {
    pub fn new(opts: ServerOptions) -> anyhow::Result<Self> {
        Ok(Self { opts })
    }

    pub fn relay(&self) -> Arc<Relay> {
        self.opts.relay.clone()
    }

    pub async fn bind(&self) -> anyhow::Result<Box<dyn TransportListener>> {
        let tr = transport_by_name(&self.opts.transport)?;
        let ln = tr
            .listen(
                &self.opts.listen_addr,
                TransportListenOptions {
                    tls: self.opts.tls.clone(),
                },
            )
            .await?;
        tracing::info!(
            addr = %self.opts.listen_addr,
            local = ?ln.local_addr(),
            transport = %tr.name(),
            "relay: listening"
        );
        Ok(ln)
    }

    pub async fn listen_and_serve(&self, shutdown: tokio::sync::watch::Receiver<bool>) -> anyhow::Result<()> {
        let ln = self.bind().await?;
        self.serve(ln, shutdown).await
    }

    pub async fn serve(
        &self,
        ln: Box<dyn TransportListener>,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let transport: &'static str = transport_by_name(&self.opts.transport)?.name();
        let handshake_timeout = self.opts.relay.options().handshake_timeout;

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                inc = ln.accept() => {
                    let inc = match inc {
                        Ok(inc) => inc,
                        Err(err) => {
                            // Accept errors (EMFILE and friends) are transient.
                            tracing::warn!(err = %err, "relay: accept failed");
                            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                            continue;
                        }
                    };
                    let relay = self.opts.relay.clone();
                    let peer: Option<SocketAddr> = inc.peer;
                    tokio::spawn(async move {
                        let stream = match tokio::time::timeout(handshake_timeout, inc.upgrade).await {
                            Ok(Ok(s)) => s,
                            Ok(Err(err)) => {
                                tracing::debug!(peer = ?peer, err = %err, "relay: transport handshake failed");
                                return;
                            }
                            Err(_) => {
                                tracing::debug!(peer = ?peer, "relay: transport handshake timed out");
                                return;
                            }
                        };
                        relay.serve_connection(stream, peer, transport).await;
                    });
                }
            }
        }

        tracing::info!(addr = %self.opts.listen_addr, "relay: listener stopped");
        Ok(())
    }
}
