use std::{net::SocketAddr, sync::Arc, time::Duration};

use crate::rendezvous::{
    telemetry::{self, SharedConnections},
    tunnel::{
        auth::SharedAuthenticator, connection, dispatcher::ControlDispatcher,
        manager::RelayManager, transport::BoxedStream,
    },
};

#[derive(Debug, Clone)]
pub struct RelayOptions {
    pub server_name: String,
    /// Hello through registration must finish within this.
    pub handshake_timeout: Duration,
    /// Closes registered connections after this much silence.
    pub idle_timeout: Option<Duration>,
    pub call_timeout: Duration,
    pub auth_timeout: Duration,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            server_name: "rendezvous".into(),
            handshake_timeout: Duration::from_secs(10),
            idle_timeout: None,
            call_timeout: Duration::from_secs(5),
            auth_timeout: Duration::from_secs(8),
        }
    }
}

/// Everything a relay connection needs, built once at startup and shared by
/// all listeners.
pub struct Relay {
    manager: Arc<RelayManager>,
    dispatcher: ControlDispatcher,
    opts: RelayOptions,
    connections: SharedConnections,
}

impl std::fmt::Debug for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relay").field("opts", &self.opts).finish_non_exhaustive()
    }
}

impl Relay {
    pub fn new(opts: RelayOptions, authenticator: Option<SharedAuthenticator>) -> Arc<Self> {
        let manager = Arc::new(RelayManager::new());
        let dispatcher = ControlDispatcher::new(
            manager.clone(),
            authenticator,
            opts.server_name.clone(),
            opts.call_timeout,
            opts.auth_timeout,
        );
        Arc::new(Self {
            manager,
            dispatcher,
            opts,
            connections: Arc::new(telemetry::ConnectionRegistry::new()),
        })
    }

    pub fn manager(&self) -> &Arc<RelayManager> {
        &self.manager
    }

    pub fn dispatcher(&self) -> &ControlDispatcher {
        &self.dispatcher
    }

    pub fn options(&self) -> &RelayOptions {
        &self.opts
    }

    pub fn connections(&self) -> &SharedConnections {
        &self.connections
    }

    /// Runs one accepted connection to completion.
    pub async fn serve_connection(
        self: &Arc<Self>,
        stream: BoxedStream,
        peer: Option<SocketAddr>,
        transport: &'static str,
    ) {
        connection::serve(self.clone(), stream, peer, transport).await
    }
}
