use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use tokio::sync::{RwLock, broadcast};
use uuid::Uuid;

use crate::rendezvous::tunnel::{
    api::TunnelProxyError,
    handle::{ConnectionHandle, ConnectionId},
    session::{RelaySession, SessionSnapshot},
};

const EVENT_BUFFER: usize = 256;

/// Lifecycle changes published by the relay.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RelayEvent {
    ServerRegistered { server_uuid: Uuid, server_name: String },
    ServerUnregistered { server_uuid: Uuid, released_clients: usize },
    ClientRegistered { server_uuid: Uuid, client_uuid: Uuid, address: u16 },
    ClientUnregistered { server_uuid: Uuid, client_uuid: Uuid, address: u16 },
}

/// Parses a wire uuid. The nil uuid is rejected like any malformed one.
pub fn parse_uuid(raw: &str) -> Result<Uuid, TunnelProxyError> {
    match Uuid::parse_str(raw.trim()) {
        Ok(u) if !u.is_nil() => Ok(u),
        _ => Err(TunnelProxyError::InvalidUuid),
    }
}

struct State {
    sessions: HashMap<Uuid, Arc<RelaySession>>,
    servers_by_conn: HashMap<ConnectionId, Uuid>,
}

/// Table of live server sessions, keyed by server uuid.
pub struct RelayManager {
    conn_seq: AtomicU64,
    state: RwLock<State>,
    events: broadcast::Sender<RelayEvent>,
}

impl std::fmt::Debug for RelayManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayManager").finish_non_exhaustive()
    }
}

impl Default for RelayManager {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayManager {
    pub fn new() -> Self {
        let (events, _rx) = broadcast::channel(EVENT_BUFFER);
        Self {
            conn_seq: AtomicU64::new(1),
            state: RwLock::new(State {
                sessions: HashMap::new(),
                servers_by_conn: HashMap::new(),
            }),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.events.subscribe()
    }

    pub fn next_connection_id(&self) -> ConnectionId {
        ConnectionId(self.conn_seq.fetch_add(1, Ordering::Relaxed))
    }

    /// Keeps the session table locked for `d`, stalling every registration.
    #[cfg(test)]
    pub(crate) async fn hold_state_lock(&self, d: std::time::Duration) {
        let _st = self.state.write().await;
        tokio::time::sleep(d).await;
    }

    pub async fn register_server(
        &self,
        conn: &ConnectionHandle,
        server_uuid: &str,
        server_name: &str,
    ) -> Result<Arc<RelaySession>, TunnelProxyError> {
        let uuid = parse_uuid(server_uuid)?;
        let mut st = self.state.write().await;
        if st.servers_by_conn.contains_key(&conn.id()) || st.sessions.contains_key(&uuid) {
            return Err(TunnelProxyError::AlreadyRegistered);
        }
        let session = Arc::new(RelaySession::new(
            uuid,
            server_name.to_string(),
            conn.clone(),
            self.events.clone(),
        ));
        st.sessions.insert(uuid, session.clone());
        st.servers_by_conn.insert(conn.id(), uuid);
        drop(st);

        metrics::gauge!("rendezvous_sessions").increment(1.0);
        let _ = self.events.send(RelayEvent::ServerRegistered {
            server_uuid: uuid,
            server_name: server_name.to_string(),
        });
        tracing::info!(conn = %conn.id(), server_uuid = %uuid, server_name = %server_name, "relay: server registered");
        Ok(session)
    }

    pub async fn register_client(
        &self,
        conn: &ConnectionHandle,
        client_uuid: &str,
        client_name: &str,
        server_uuid: &str,
    ) -> Result<(Arc<RelaySession>, u16), TunnelProxyError> {
        let client_uuid = parse_uuid(client_uuid)?;
        let server_uuid = parse_uuid(server_uuid)?;

        let st = self.state.read().await;
        if st.servers_by_conn.contains_key(&conn.id()) {
            return Err(TunnelProxyError::AlreadyRegistered);
        }
        let session = st
            .sessions
            .get(&server_uuid)
            .cloned()
            .ok_or(TunnelProxyError::ServerNotFound)?;
        // Bind while holding the read lock so a concurrent server teardown
        // cannot slip in between lookup and bind.
        let address = session.bind_client(conn, client_uuid, client_name)?;
        drop(st);

        metrics::gauge!("rendezvous_bound_clients").increment(1.0);
        tracing::info!(
            conn = %conn.id(),
            server_uuid = %server_uuid,
            client_uuid = %client_uuid,
            client_name = %client_name,
            address,
            "relay: client bound"
        );
        Ok((session, address))
    }

    /// Drops one client on behalf of the server connection `caller`.
    pub async fn disconnect_client(
        &self,
        caller: &ConnectionHandle,
        address: u16,
    ) -> Result<(), TunnelProxyError> {
        let session = {
            let st = self.state.read().await;
            let uuid = st
                .servers_by_conn
                .get(&caller.id())
                .ok_or(TunnelProxyError::NotRegistered)?;
            st.sessions
                .get(uuid)
                .cloned()
                .ok_or(TunnelProxyError::NotRegistered)?
        };
        session.disconnect_client(address)?;
        metrics::gauge!("rendezvous_bound_clients").decrement(1.0);
        tracing::debug!(conn = %caller.id(), address, "relay: client disconnected by server");
        Ok(())
    }

    /// The server connection backing `session` ended. The session is removed
    /// and every bound client is closed.
    pub async fn server_disconnected(&self, session: &Arc<RelaySession>) {
        let uuid = session.server_uuid();
        let mut st = self.state.write().await;
        if !st
            .sessions
            .get(&uuid)
            .is_some_and(|cur| Arc::ptr_eq(cur, session))
        {
            return;
        }
        st.sessions.remove(&uuid);
        st.servers_by_conn.remove(&session.server().id());
        // Teardown under the write lock: a racing RegisterClient either
        // bound before this point and is drained here, or sees no session.
        let released = session.teardown("server disconnected");
        drop(st);

        metrics::gauge!("rendezvous_sessions").decrement(1.0);
        metrics::gauge!("rendezvous_bound_clients").decrement(released.len() as f64);
        let _ = self.events.send(RelayEvent::ServerUnregistered {
            server_uuid: uuid,
            released_clients: released.len(),
        });
        tracing::info!(server_uuid = %uuid, released = released.len(), "relay: server unregistered");
    }

    /// A bound client connection ended on its own.
    pub async fn client_disconnected(&self, session: &Arc<RelaySession>, conn: ConnectionId) {
        if let Some(address) = session.unbind_client(conn) {
            metrics::gauge!("rendezvous_bound_clients").decrement(1.0);
            tracing::debug!(conn = %conn, server_uuid = %session.server_uuid(), address, "relay: client unbound");
        }
    }

    pub async fn lookup(&self, server_uuid: &Uuid) -> Option<Arc<RelaySession>> {
        self.state.read().await.sessions.get(server_uuid).cloned()
    }

    pub async fn session_count(&self) -> usize {
        self.state.read().await.sessions.len()
    }

    pub async fn snapshot(&self) -> Vec<SessionSnapshot> {
        let st = self.state.read().await;
        let mut out: Vec<SessionSnapshot> = st.sessions.values().map(|s| s.snapshot()).collect();
        out.sort_by_key(|s| s.created_at_unix_ms);
        out
    }
}
