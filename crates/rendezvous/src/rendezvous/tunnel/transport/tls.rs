use std::{fs, net::SocketAddr, path::Path, sync::Arc};

use async_trait::async_trait;
use rcgen::generate_simple_self_signed;
use rustls::{
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::CryptoProvider,
    pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime},
};
use tokio::net::TcpListener;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::rendezvous::net;
use crate::rendezvous::tunnel::transport::{
    BoxedStream, Incoming, TlsDialOptions, TlsListenOptions, Transport, TransportDialOptions,
    TransportListenOptions, TransportListener, tcp,
};

pub struct TlsTransport;

impl TlsTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for TlsTransport {
    fn name(&self) -> &'static str {
        "tls"
    }

    async fn listen(
        &self,
        addr: &str,
        opts: TransportListenOptions,
    ) -> anyhow::Result<Box<dyn TransportListener>> {
        let cfg = server_config(&opts.tls)?;
        let ln = tcp::bind(addr).await?;
        Ok(Box::new(TlsTransportListener {
            ln,
            acceptor: TlsAcceptor::from(Arc::new(cfg)),
        }))
    }

    async fn dial(&self, addr: &str, opts: TransportDialOptions) -> anyhow::Result<BoxedStream> {
        let name = if opts.tls.server_name.trim().is_empty() {
            net::host_of(addr).to_string()
        } else {
            opts.tls.server_name.trim().to_string()
        };
        let server_name = ServerName::try_from(name.clone())
            .map_err(|_| anyhow::anyhow!("tunnel: invalid tls server name {name:?}"))?;
        let connector = TlsConnector::from(Arc::new(client_config(&opts.tls)?));
        let c = tcp::connect(addr).await?;
        let st = connector.connect(server_name, c).await?;
        Ok(Box::new(st))
    }
}

pub struct TlsTransportListener {
    ln: TcpListener,
    acceptor: TlsAcceptor,
}

#[async_trait]
impl TransportListener for TlsTransportListener {
    async fn accept(&self) -> anyhow::Result<Incoming> {
        let (c, peer) = self.ln.accept().await?;
        let _ = c.set_nodelay(true);
        let acceptor = self.acceptor.clone();
        Ok(Incoming {
            peer: Some(peer),
            upgrade: Box::pin(async move {
                let st = acceptor.accept(c).await?;
                Ok(Box::new(st) as BoxedStream)
            }),
        })
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.ln.local_addr().ok()
    }
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

pub fn server_config(opts: &TlsListenOptions) -> anyhow::Result<rustls::ServerConfig> {
    let (certs, key) = load_or_generate_cert(&opts.cert_file, &opts.key_file)?;
    let cfg = rustls::ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(cfg)
}

pub fn client_config(opts: &TlsDialOptions) -> anyhow::Result<rustls::ClientConfig> {
    let builder = rustls::ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?;
    if opts.insecure_skip_verify {
        return Ok(builder
            .dangerous()
            .with_custom_certificate_verifier(SkipServerVerification::new())
            .with_no_client_auth());
    }

    let mut roots = rustls::RootCertStore::empty();
    let ca_file = opts.ca_file.trim();
    if !ca_file.is_empty() {
        for c in load_certs(Path::new(ca_file))? {
            roots.add(c)?;
        }
    }
    if roots.is_empty() {
        anyhow::bail!("tunnel: tls dial needs ca_file or insecure_skip_verify");
    }
    Ok(builder.with_root_certificates(roots).with_no_client_auth())
}

/// Loads a PEM certificate chain and key, or generates a self-signed
/// `localhost` certificate when both paths are empty.
pub fn load_or_generate_cert(
    cert_file: &str,
    key_file: &str,
) -> anyhow::Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let cert_file = cert_file.trim();
    let key_file = key_file.trim();

    if !cert_file.is_empty() || !key_file.is_empty() {
        if cert_file.is_empty() || key_file.is_empty() {
            anyhow::bail!("tunnel: tls requires both cert_file and key_file (or neither to auto-generate)");
        }
        let certs = load_certs(Path::new(cert_file))?;
        let key = load_key(Path::new(key_file))?;
        return Ok((certs, key));
    }

    tracing::warn!("tunnel: no tls certificate configured; using a generated self-signed one");
    let rcgen::CertifiedKey { cert, signing_key } =
        generate_simple_self_signed(["localhost".to_string()])?;
    let key_der = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(signing_key.serialize_der()));
    Ok((vec![cert.der().clone()], key_der))
}

fn load_certs(path: &Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let data = fs::read(path)?;
    let mut rd = std::io::Cursor::new(&data);
    let certs = rustls_pemfile::certs(&mut rd).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        anyhow::bail!("tunnel: no certificate found in {}", path.display());
    }
    Ok(certs)
}

fn load_key(path: &Path) -> anyhow::Result<PrivateKeyDer<'static>> {
    let data = fs::read(path)?;
    let mut rd = std::io::Cursor::new(&data);
    let Some(k) = rustls_pemfile::private_key(&mut rd)? else {
        anyhow::bail!("tunnel: no private key found in {}", path.display());
    };
    Ok(k)
}

/// Accepts any server certificate.
///
/// NOTE: vulnerable to MITM. Intended for self-signed relays in development.
#[derive(Debug)]
struct SkipServerVerification(Arc<CryptoProvider>);

impl SkipServerVerification {
    fn new() -> Arc<Self> {
        Arc::new(Self(provider()))
    }
}

impl ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn cert_and_key_must_come_together() {
        assert!(load_or_generate_cert("cert.pem", "").is_err());
        assert!(load_or_generate_cert("", "key.pem").is_err());
        let (certs, _key) = load_or_generate_cert("", "").unwrap();
        assert_eq!(certs.len(), 1);
    }

    #[test]
    fn verified_dial_needs_roots() {
        assert!(client_config(&TlsDialOptions::default()).is_err());
        let insecure = TlsDialOptions {
            insecure_skip_verify: true,
            ..Default::default()
        };
        assert!(client_config(&insecure).is_ok());
    }

    #[tokio::test]
    async fn self_signed_roundtrip() {
        let tr = TlsTransport::new();
        let ln = tr.listen("127.0.0.1:0", Default::default()).await.unwrap();
        let addr = ln.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let inc = ln.accept().await.unwrap();
            let mut s = inc.upgrade.await.unwrap();
            let mut buf = [0u8; 5];
            s.read_exact(&mut buf).await.unwrap();
            s.write_all(&buf).await.unwrap();
            s.flush().await.unwrap();
            buf
        });

        let opts = TransportDialOptions {
            tls: TlsDialOptions {
                server_name: "localhost".into(),
                insecure_skip_verify: true,
                ca_file: String::new(),
            },
        };
        let mut c = TlsTransport::new().dial(&addr.to_string(), opts).await.unwrap();
        c.write_all(b"hello").await.unwrap();
        c.flush().await.unwrap();
        let mut echo = [0u8; 5];
        c.read_exact(&mut echo).await.unwrap();
        assert_eq!(&echo, b"hello");
        assert_eq!(&server.await.unwrap(), b"hello");
    }
}
