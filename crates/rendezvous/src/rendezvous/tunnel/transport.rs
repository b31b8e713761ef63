use std::{future::Future, net::SocketAddr, pin::Pin, sync::Arc};

use async_trait::async_trait;

/// A bidirectional async byte stream.
///
/// Rust trait objects can only have a single non-auto "principal" trait, so we
/// wrap `AsyncRead + AsyncWrite` into a single trait.
pub trait AsyncStream: tokio::io::AsyncRead + tokio::io::AsyncWrite {}
impl<T> AsyncStream for T where T: tokio::io::AsyncRead + tokio::io::AsyncWrite + ?Sized {}

pub type BoxedStream = Box<dyn AsyncStream + Unpin + Send>;

/// Completes the transport-level handshake of an accepted connection (a TLS
/// handshake, or nothing for plain TCP).
pub type Upgrade = Pin<Box<dyn Future<Output = anyhow::Result<BoxedStream>> + Send>>;

pub struct Incoming {
    pub peer: Option<SocketAddr>,
    pub upgrade: Upgrade,
}

impl Incoming {
    pub fn ready(peer: Option<SocketAddr>, stream: BoxedStream) -> Self {
        Self {
            peer,
            upgrade: Box::pin(async move { Ok(stream) }),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TlsListenOptions {
    pub cert_file: String,
    pub key_file: String,
}

#[derive(Debug, Clone, Default)]
pub struct TlsDialOptions {
    /// SNI and verification name; the dialed host is used when empty.
    pub server_name: String,
    pub insecure_skip_verify: bool,
    /// PEM bundle of trusted roots; required unless `insecure_skip_verify`.
    pub ca_file: String,
}

#[derive(Debug, Clone, Default)]
pub struct TransportListenOptions {
    pub tls: TlsListenOptions,
}

#[derive(Debug, Clone, Default)]
pub struct TransportDialOptions {
    pub tls: TlsDialOptions,
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;
    /// Whether dial addresses are `host:port` and need a lookup first.
    fn uses_host_lookup(&self) -> bool {
        true
    }
    async fn listen(
        &self,
        addr: &str,
        opts: TransportListenOptions,
    ) -> anyhow::Result<Box<dyn TransportListener>>;
    async fn dial(&self, addr: &str, opts: TransportDialOptions) -> anyhow::Result<BoxedStream>;
}

#[async_trait]
pub trait TransportListener: Send + Sync {
    async fn accept(&self) -> anyhow::Result<Incoming>;
    fn local_addr(&self) -> Option<SocketAddr>;
}

pub fn parse_transport(name: &str) -> anyhow::Result<String> {
    let mut n = name.trim().to_ascii_lowercase();
    if n.is_empty() {
        n = "tcp".into();
    }
    match n.as_str() {
        "tcp" | "tls" | "unix" => Ok(n),
        _ => anyhow::bail!("tunnel: unknown transport {name:?} (expected tcp|tls|unix)"),
    }
}

pub mod tcp;
pub mod tls;
#[cfg(unix)]
pub mod unix;

pub fn transport_by_name(name: &str) -> anyhow::Result<Arc<dyn Transport>> {
    let n = parse_transport(name)?;
    match n.as_str() {
        "tcp" => Ok(Arc::new(tcp::TcpTransport::new())),
        "tls" => Ok(Arc::new(tls::TlsTransport::new())),
        #[cfg(unix)]
        "unix" => Ok(Arc::new(unix::UnixTransport::new())),
        other => anyhow::bail!("tunnel: transport {other:?} is not available on this platform"),
    }
}
