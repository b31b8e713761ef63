use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::rendezvous::{
    admin, config, logging, net, telemetry,
    tunnel::{
        self,
        auth::{HttpAuthenticator, SharedAuthenticator, TokenAuthenticator},
        client::{TunnelClientOptions, TunnelRole},
        peer::{ExposeOptions, ForwardOptions},
        relay::{Relay, RelayOptions},
    },
};

pub async fn run(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(config_path)?;
    let created = config::ensure_config_file(&resolved.path)?;

    let cfg = config::load_config(&resolved.path)
        .with_context(|| format!("load config: {}", resolved.path.display()))?;

    let _logrt = logging::init(&cfg.logging)?;

    if created {
        tracing::warn!(path = %resolved.path.display(), source = %resolved.source, "config: created new config file");
    }

    tracing::info!(
        config = %resolved.path.display(),
        relay_enabled = cfg.relay.is_some(),
        relay_listeners = cfg.relay.as_ref().map(|r| r.listeners.len()).unwrap_or(0),
        peers = cfg.peers.len(),
        admin_addr = %cfg.admin_addr,
        "rendezvous: starting"
    );

    let prom = Arc::new(telemetry::init_prometheus()?);
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mut tasks = JoinSet::new();

    let relay = match &cfg.relay {
        Some(rc) => Some(start_relay(rc, &mut tasks, &shutdown_rx)?),
        None => None,
    };

    for (i, p) in cfg.peers.iter().enumerate() {
        let shutdown = shutdown_rx.clone();
        match p.mode {
            config::PeerMode::Expose => {
                let opts = ExposeOptions {
                    tunnel: peer_tunnel_options(
                        p,
                        TunnelRole::Server {
                            server_uuid: p.server_uuid,
                            server_name: p.name.clone(),
                        },
                    ),
                    local_addr: p.local_addr.clone(),
                };
                tasks.spawn(async move {
                    tunnel::peer::run_expose(opts, shutdown)
                        .await
                        .with_context(|| format!("peers[{i}] expose"))
                });
            }
            config::PeerMode::Forward => {
                let opts = ForwardOptions {
                    tunnel: peer_tunnel_options(
                        p,
                        TunnelRole::Client {
                            client_uuid: Uuid::nil(),
                            client_name: p.name.clone(),
                            server_uuid: p.server_uuid,
                        },
                    ),
                    listen_addr: p.listen_addr.clone(),
                };
                tasks.spawn(async move {
                    tunnel::peer::forward(opts, shutdown)
                        .await
                        .with_context(|| format!("peers[{i}] forward"))
                });
            }
        }
    }

    if !cfg.admin_addr.trim().is_empty() {
        let admin_addr = net::normalize_bind_addr(&cfg.admin_addr);
        let addr: SocketAddr = admin_addr
            .parse()
            .with_context(|| format!("invalid admin_addr: {}", cfg.admin_addr))?;
        let state = admin::AdminState {
            prom: prom.clone(),
            relay: relay.clone(),
        };
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { admin::serve_with_shutdown(addr, state, shutdown).await });
    }

    // Wait for shutdown signal (Ctrl-C / SIGTERM) or a task ending on its own.
    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown: signal");
            let _ = shutdown_tx.send(true);
        }
        res = tasks.join_next() => {
            let _ = shutdown_tx.send(true);
            match res {
                Some(Ok(Err(err))) => return Err(err),
                Some(Err(join_err)) => return Err(join_err.into()),
                Some(Ok(Ok(()))) | None => {}
            }
        }
    }

    let drain = async { while tasks.join_next().await.is_some() {} };
    if tokio::time::timeout(Duration::from_secs(5), drain).await.is_err() {
        tracing::warn!("shutdown: drain timed out, aborting tasks");
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    Ok(())
}

fn start_relay(
    rc: &config::RelayConfig,
    tasks: &mut JoinSet<anyhow::Result<()>>,
    shutdown_rx: &tokio::sync::watch::Receiver<bool>,
) -> anyhow::Result<Arc<Relay>> {
    let authenticator = build_authenticator(&rc.authentication)?;
    if let Some(a) = &authenticator {
        tracing::info!(kind = a.kind(), "relay: authentication enabled");
    }

    let relay = Relay::new(
        RelayOptions {
            server_name: rc.server_name.clone(),
            handshake_timeout: rc.timeouts.handshake,
            idle_timeout: rc.timeouts.idle,
            call_timeout: rc.timeouts.call,
            auth_timeout: rc.timeouts.authentication,
        },
        authenticator,
    );

    {
        let events = relay.manager().subscribe();
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move {
            telemetry::record_relay_events(events, shutdown).await;
            Ok(())
        });
    }

    for l in &rc.listeners {
        let server = tunnel::server::Server::new(tunnel::server::ServerOptions {
            listen_addr: l.listen_addr.clone(),
            transport: l.transport.clone(),
            tls: l.tls.clone(),
            relay: relay.clone(),
        })?;
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { server.listen_and_serve(shutdown).await });
    }

    Ok(relay)
}

fn build_authenticator(ac: &config::AuthConfig) -> anyhow::Result<Option<SharedAuthenticator>> {
    Ok(match ac.mode {
        config::AuthMode::None => None,
        config::AuthMode::Token => Some(Arc::new(TokenAuthenticator::new(ac.token.clone()))),
        config::AuthMode::Http => Some(Arc::new(
            HttpAuthenticator::new(ac.url.clone(), ac.timeout).context("relay: http authenticator")?,
        )),
    })
}

fn peer_tunnel_options(p: &config::PeerConfig, role: TunnelRole) -> TunnelClientOptions {
    let mut opts = TunnelClientOptions::new(p.relay_addr.clone(), role);
    opts.transport = p.transport.clone();
    opts.tls = p.tls.clone();
    opts.token = p.token.clone();
    opts.auto_reconnect = p.auto_reconnect;
    opts.connect_timeout = p.connect_timeout;
    opts.ping_interval = p.ping_interval;
    opts.reconnect_interval = p.reconnect_interval;
    opts
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authenticator_follows_mode() {
        let mut ac = config::AuthConfig {
            mode: config::AuthMode::None,
            token: String::new(),
            url: String::new(),
            timeout: Duration::from_secs(1),
        };
        assert!(build_authenticator(&ac).unwrap().is_none());

        ac.mode = config::AuthMode::Token;
        ac.token = "t".into();
        assert_eq!(build_authenticator(&ac).unwrap().unwrap().kind(), "token");

        ac.mode = config::AuthMode::Http;
        ac.url = "http://127.0.0.1:9/verify".into();
        assert_eq!(build_authenticator(&ac).unwrap().unwrap().kind(), "http");
    }
}
