use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::Context;
use dashmap::DashMap;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use uuid::Uuid;

use crate::rendezvous::tunnel::{handle::ConnectionId, manager::RelayEvent};

/// Installs a Prometheus recorder for the `metrics` crate and returns a handle used to render
/// the exposition format.
///
/// This should be called once per process at startup.
pub fn init_prometheus() -> anyhow::Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .context("metrics: install Prometheus recorder")
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub peer: String,
    pub transport: &'static str,
    pub state: &'static str,
    pub server_uuid: Option<Uuid>,
    pub address: Option<u16>,
    pub started_at_unix_ms: u64,
}

/// Live relay connections, for the admin API.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    conns: DashMap<ConnectionId, ConnectionInfo>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, c: ConnectionInfo) {
        self.conns.insert(c.id, c);
    }

    pub fn update(&self, id: ConnectionId, f: impl FnOnce(&mut ConnectionInfo)) {
        if let Some(mut c) = self.conns.get_mut(&id) {
            f(c.value_mut());
        }
    }

    pub fn remove(&self, id: ConnectionId) {
        self.conns.remove(&id);
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    pub fn snapshot(&self) -> Vec<ConnectionInfo> {
        let mut out: Vec<ConnectionInfo> = self.conns.iter().map(|c| c.value().clone()).collect();
        out.sort_by_key(|c| (c.started_at_unix_ms, c.id));
        out
    }
}

pub fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Logs relay lifecycle events and counts them per kind until shutdown.
pub async fn record_relay_events(
    mut events: broadcast::Receiver<RelayEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
            ev = events.recv() => match ev {
                Ok(ev) => {
                    let kind = match &ev {
                        RelayEvent::ServerRegistered { .. } => "server_registered",
                        RelayEvent::ServerUnregistered { .. } => "server_unregistered",
                        RelayEvent::ClientRegistered { .. } => "client_registered",
                        RelayEvent::ClientUnregistered { .. } => "client_unregistered",
                    };
                    metrics::counter!("rendezvous_relay_events_total", "event" => kind).increment(1);
                    tracing::debug!(event = ?ev, "relay: event");
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "relay: event stream lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            },
        }
    }
}

pub type SharedConnections = Arc<ConnectionRegistry>;

pub type SharedPrometheusHandle = Arc<PrometheusHandle>;

#[cfg(test)]
mod tests {
    use super::*;

    fn info(n: u64, started: u64) -> ConnectionInfo {
        ConnectionInfo {
            id: ConnectionId(n),
            peer: "127.0.0.1".into(),
            transport: "tcp",
            state: "connected",
            server_uuid: None,
            address: None,
            started_at_unix_ms: started,
        }
    }

    #[test]
    fn registry_tracks_updates_in_start_order() {
        let r = ConnectionRegistry::new();
        r.add(info(2, 20));
        r.add(info(1, 10));
        r.update(ConnectionId(2), |c| c.state = "relaying");
        let snap = r.snapshot();
        assert_eq!(snap.iter().map(|c| c.id.0).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(snap[1].state, "relaying");
        r.remove(ConnectionId(1));
        assert_eq!(r.len(), 1);
    }
}
