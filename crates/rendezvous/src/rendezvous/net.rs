use std::{borrow::Cow, net::SocketAddr};

/// Normalize a bind/listen address.
///
/// Config files use the shorthand `":PORT"` for "all interfaces", which
/// `SocketAddr` parsing and Tokio bind APIs do not accept.
pub fn normalize_bind_addr(addr: &str) -> Cow<'_, str> {
    let addr = addr.trim();
    if addr.starts_with(':') {
        Cow::Owned(format!("0.0.0.0{addr}"))
    } else {
        Cow::Borrowed(addr)
    }
}

/// Host part of a `host:port` address, without IPv6 brackets.
pub fn host_of(addr: &str) -> &str {
    let addr = addr.trim();
    if let Some(rest) = addr.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    match addr.rsplit_once(':') {
        Some((host, _)) if !host.contains(':') => host,
        Some(_) => addr,
        None => addr,
    }
}

/// Resolves `host:port` to socket addresses, literal addresses first.
pub async fn lookup(addr: &str) -> anyhow::Result<Vec<SocketAddr>> {
    let addr = addr.trim();
    if let Ok(sa) = addr.parse::<SocketAddr>() {
        return Ok(vec![sa]);
    }
    let found: Vec<SocketAddr> = tokio::net::lookup_host(addr).await?.collect();
    if found.is_empty() {
        anyhow::bail!("net: could not resolve {addr:?}");
    }
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_bind_addr_port_only() {
        assert_eq!(normalize_bind_addr(":2213").as_ref(), "0.0.0.0:2213");
        assert_eq!(normalize_bind_addr(" :7000 ").as_ref(), "0.0.0.0:7000");
        assert_eq!(normalize_bind_addr("[::]:8080").as_ref(), "[::]:8080");
    }

    #[test]
    fn host_of_handles_names_and_literals() {
        assert_eq!(host_of("relay.example.org:2213"), "relay.example.org");
        assert_eq!(host_of("127.0.0.1:1"), "127.0.0.1");
        assert_eq!(host_of("[::1]:2213"), "::1");
        assert_eq!(host_of("localhost"), "localhost");
    }

    #[tokio::test]
    async fn lookup_literal_and_localhost() {
        assert_eq!(lookup("127.0.0.1:9").await.unwrap(), vec!["127.0.0.1:9".parse().unwrap()]);
        let got = lookup("localhost:9").await.unwrap();
        assert!(got.iter().all(|a| a.port() == 9 && a.ip().is_loopback()));
    }
}
