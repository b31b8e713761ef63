use std::sync::{
    Mutex, MutexGuard, PoisonError,
    atomic::{AtomicU64, Ordering},
};

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::rendezvous::{
    telemetry,
    tunnel::{
        api::{self, ClientConnectedParams, ClientDisconnectedParams, TunnelProxyError},
        handle::{ConnectionHandle, ConnectionId},
        manager::RelayEvent,
        registry::{AddressRegistry, ClientBinding, RegistryError},
        rpc::{self, RpcNotification},
        slip,
    },
};

struct SessionInner {
    registry: AddressRegistry,
    notification_seq: i64,
    closed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct BoundClientSnapshot {
    pub address: u16,
    pub client_uuid: Uuid,
    pub client_name: String,
    pub peer: String,
    pub connection: ConnectionId,
    pub bound_at_unix_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub server_uuid: Uuid,
    pub server_name: String,
    pub server_peer: String,
    pub connection: ConnectionId,
    pub created_at_unix_ms: u64,
    pub last_activity_unix_ms: u64,
    pub clients: Vec<BoundClientSnapshot>,
}

/// One registered server and the clients currently attached to it.
pub struct RelaySession {
    server_uuid: Uuid,
    server_name: String,
    server: ConnectionHandle,
    created_at_unix_ms: u64,
    last_activity_ms: AtomicU64,
    inner: Mutex<SessionInner>,
    events: broadcast::Sender<RelayEvent>,
}

impl std::fmt::Debug for RelaySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelaySession")
            .field("server_uuid", &self.server_uuid)
            .field("server_name", &self.server_name)
            .field("server", &self.server.id())
            .finish_non_exhaustive()
    }
}

impl RelaySession {
    pub(crate) fn new(
        server_uuid: Uuid,
        server_name: String,
        server: ConnectionHandle,
        events: broadcast::Sender<RelayEvent>,
    ) -> Self {
        let now = telemetry::now_unix_ms();
        Self {
            server_uuid,
            server_name,
            server,
            created_at_unix_ms: now,
            last_activity_ms: AtomicU64::new(now),
            inner: Mutex::new(SessionInner {
                registry: AddressRegistry::new(),
                notification_seq: 0,
                closed: false,
            }),
            events,
        }
    }

    // The guarded state stays consistent across every early return, so a
    // poisoned lock is still usable.
    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn server_uuid(&self) -> Uuid {
        self.server_uuid
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn server(&self) -> &ConnectionHandle {
        &self.server
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn bound_clients(&self) -> usize {
        self.lock().registry.len()
    }

    pub fn touch(&self) {
        self.last_activity_ms
            .store(telemetry::now_unix_ms(), Ordering::Relaxed);
    }

    /// Attaches a client and announces it to the server with
    /// `TunnelProxy.ClientConnected`.
    pub fn bind_client(
        &self,
        client: &ConnectionHandle,
        client_uuid: Uuid,
        client_name: &str,
    ) -> Result<u16, TunnelProxyError> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(TunnelProxyError::ServerNotFound);
        }
        if inner.registry.contains_client(&client_uuid) {
            return Err(TunnelProxyError::AlreadyRegistered);
        }
        let address = inner
            .registry
            .allocate(ClientBinding {
                handle: client.clone(),
                client_uuid,
                client_name: client_name.to_string(),
                bound_at_unix_ms: telemetry::now_unix_ms(),
            })
            .map_err(|e| match e {
                RegistryError::Exhausted => TunnelProxyError::CapacityExhausted,
                RegistryError::AlreadyBound(_) => TunnelProxyError::AlreadyRegistered,
            })?;

        let params = ClientConnectedParams {
            client_name: client_name.to_string(),
            client_uuid: client_uuid.to_string(),
            client_peer_address: client.peer_address(),
            socket_address: address,
        };
        self.notify_locked(&mut inner, api::CLIENT_CONNECTED, &params);
        drop(inner);

        self.touch();
        let _ = self.events.send(RelayEvent::ClientRegistered {
            server_uuid: self.server_uuid,
            client_uuid,
            address,
        });
        Ok(address)
    }

    /// The client connection went away on its own. The server is told with
    /// `TunnelProxy.ClientDisconnected`.
    pub fn unbind_client(&self, conn: ConnectionId) -> Option<u16> {
        let mut inner = self.lock();
        let (address, binding) = inner.registry.release_connection(conn)?;
        if !inner.closed {
            self.notify_locked(
                &mut inner,
                api::CLIENT_DISCONNECTED,
                &ClientDisconnectedParams {
                    socket_address: address,
                },
            );
        }
        drop(inner);
        self.emit_unregistered(binding.client_uuid, address);
        Some(address)
    }

    /// The server asked for the client at `address` to be dropped. No
    /// notification is sent back; the server already knows.
    pub fn disconnect_client(&self, address: u16) -> Result<(), TunnelProxyError> {
        let binding = self
            .lock()
            .registry
            .release(address)
            .ok_or(TunnelProxyError::InvalidSocketAddress)?;
        binding.handle.close("disconnected by server");
        self.emit_unregistered(binding.client_uuid, address);
        Ok(())
    }

    /// Server to client: `payload` is written to the client verbatim.
    pub fn route_to_client(&self, address: u16, payload: Bytes) -> bool {
        let handle = match self.lock().registry.lookup(address) {
            Some(b) => b.handle.clone(),
            None => return false,
        };
        let n = payload.len() as u64;
        if handle.send_tunnel(payload) {
            self.touch();
            metrics::counter!("rendezvous_tunnel_bytes_total", "direction" => "to_client")
                .increment(n);
            return true;
        }
        false
    }

    /// Client to server: `payload` is framed with the client's address.
    /// Waits while the server's queue is full, which stalls only the sending
    /// client.
    pub async fn route_to_server(&self, address: u16, payload: &[u8]) -> bool {
        if payload.is_empty() {
            return true;
        }
        let ok = self
            .server
            .send_tunnel_wait(slip::encode_frame(address, payload))
            .await;
        if ok {
            self.touch();
            metrics::counter!("rendezvous_tunnel_bytes_total", "direction" => "to_server")
                .increment(payload.len() as u64);
        }
        ok
    }

    /// Queues a control-channel message to the server inside an address-0 frame.
    pub fn send_control(&self, payload: &[u8]) -> bool {
        self.server
            .send_frame(slip::encode_frame(slip::CONTROL_ADDRESS, payload))
    }

    /// Marks the session closed and disconnects every bound client. Returns
    /// the released addresses.
    pub(crate) fn teardown(&self, reason: &str) -> Vec<u16> {
        let drained = {
            let mut inner = self.lock();
            inner.closed = true;
            inner.registry.drain()
        };
        let mut out = Vec::with_capacity(drained.len());
        for (address, binding) in drained {
            binding.handle.close(reason);
            self.emit_unregistered(binding.client_uuid, address);
            out.push(address);
        }
        out
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let inner = self.lock();
        let clients = inner
            .registry
            .iter()
            .map(|(address, b)| BoundClientSnapshot {
                address,
                client_uuid: b.client_uuid,
                client_name: b.client_name.clone(),
                peer: b.handle.peer_address(),
                connection: b.handle.id(),
                bound_at_unix_ms: b.bound_at_unix_ms,
            })
            .collect();
        SessionSnapshot {
            server_uuid: self.server_uuid,
            server_name: self.server_name.clone(),
            server_peer: self.server.peer_address(),
            connection: self.server.id(),
            created_at_unix_ms: self.created_at_unix_ms,
            last_activity_unix_ms: self.last_activity_ms.load(Ordering::Relaxed),
            clients,
        }
    }

    fn notify_locked<T: Serialize>(&self, inner: &mut SessionInner, name: &str, params: &T) {
        inner.notification_seq += 1;
        let params = match serde_json::to_value(params) {
            Ok(v) => v,
            Err(err) => {
                tracing::warn!(server_uuid = %self.server_uuid, err = %err, "relay: encode notification");
                return;
            }
        };
        let n = RpcNotification {
            id: inner.notification_seq,
            notification: name.to_string(),
            params,
        };
        match rpc::encode_payload(&n) {
            Ok(body) => {
                self.send_control(&body);
            }
            Err(err) => {
                tracing::warn!(server_uuid = %self.server_uuid, err = %err, "relay: encode notification");
            }
        }
    }

    fn emit_unregistered(&self, client_uuid: Uuid, address: u16) {
        let _ = self.events.send(RelayEvent::ClientUnregistered {
            server_uuid: self.server_uuid,
            client_uuid,
            address,
        });
    }
}
