use std::{sync::Arc, time::Duration};

use serde::{Serialize, de::DeserializeOwned};
use serde_json::{Value, json};
use uuid::Uuid;

use crate::rendezvous::tunnel::{
    api::{
        self, AuthenticateParams, AuthenticateReply, AuthenticationError, DisconnectClientParams,
        HelloReply, MethodSpec, PingParams, RegisterClientParams, RegisterServerParams,
        RegisterServerReply, TunnelProxyError, TunnelProxyReply,
    },
    auth::{AuthOutcome, AuthRequest, SharedAuthenticator},
    connection::{PeerRole, RelayState},
    handle::ConnectionHandle,
    manager::{self, RelayManager},
    rpc::{self, RpcError, RpcReply, RpcRequest},
    session::RelaySession,
};

#[derive(Debug, Clone)]
pub struct PeerIdentity {
    pub uuid: Uuid,
    pub name: String,
}

#[derive(Debug, Clone)]
pub enum Binding {
    Server(Arc<RelaySession>),
    Client {
        session: Arc<RelaySession>,
        address: u16,
    },
}

/// Control-plane state of one relay connection.
#[derive(Debug)]
pub struct ControlContext {
    pub handle: ConnectionHandle,
    pub state: RelayState,
    pub authenticated: bool,
    pub identity: Option<PeerIdentity>,
    pub binding: Option<Binding>,
}

impl ControlContext {
    pub fn new(handle: ConnectionHandle) -> Self {
        Self {
            handle,
            state: RelayState::Connected,
            authenticated: false,
            identity: None,
            binding: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    None,
    /// Send the reply, then close the connection.
    Close(String),
    /// Reply sent; the connection switches to SLIP frames.
    EnterMultiplexing,
    /// Reply sent; the connection becomes a raw byte pipe.
    EnterRelaying,
}

#[derive(Debug)]
pub struct Dispatch {
    pub reply: RpcReply,
    pub action: Action,
}

impl Dispatch {
    fn ok<T: Serialize>(id: i64, params: &T) -> Self {
        Self::with(id, params, Action::None)
    }

    fn with<T: Serialize>(id: i64, params: &T, action: Action) -> Self {
        match serde_json::to_value(params) {
            Ok(v) => Self {
                reply: RpcReply::success(id, v),
                action,
            },
            Err(err) => Self {
                reply: RpcReply::error(id, format!("encode reply: {err}")),
                action: Action::Close("internal error".into()),
            },
        }
    }

    fn violation(id: i64, err: &RpcError) -> Self {
        metrics::counter!("rendezvous_protocol_violations_total").increment(1);
        Self {
            reply: RpcReply::error(id, err.to_string()),
            action: Action::Close(format!("protocol violation: {err}")),
        }
    }
}

/// Routes control messages to their handlers and enforces per-connection
/// ordering (Hello first, authentication before registration).
pub struct ControlDispatcher {
    manager: Arc<RelayManager>,
    authenticator: Option<SharedAuthenticator>,
    server_name: String,
    call_timeout: Duration,
    auth_timeout: Duration,
}

impl ControlDispatcher {
    pub fn new(
        manager: Arc<RelayManager>,
        authenticator: Option<SharedAuthenticator>,
        server_name: impl Into<String>,
        call_timeout: Duration,
        auth_timeout: Duration,
    ) -> Self {
        Self {
            manager,
            authenticator,
            server_name: server_name.into(),
            call_timeout,
            auth_timeout,
        }
    }

    pub fn manager(&self) -> &Arc<RelayManager> {
        &self.manager
    }

    pub fn requires_authentication(&self) -> bool {
        self.authenticator.is_some()
    }

    /// Handles one complete control message.
    pub async fn dispatch(&self, ctx: &mut ControlContext, data: &[u8]) -> Dispatch {
        let req = match rpc::parse_request(data) {
            Ok(r) => r,
            Err((id, err)) => return Dispatch::violation(id, &err),
        };
        let spec = match req
            .split_method()
            .and_then(|(ns, m)| api::find_method(ns, m))
        {
            Ok(s) => s,
            Err(err) => return Dispatch::violation(req.id, &err),
        };
        if let Err(err) = api::validate_params(spec, &req.params) {
            return Dispatch::violation(req.id, &err);
        }
        if ctx.state == RelayState::AwaitingHello
            && !matches!(req.method.as_str(), api::HELLO | api::INTROSPECT)
        {
            return Dispatch::violation(req.id, &RpcError::NotAllowed(req.method.clone()));
        }

        tracing::trace!(conn = %ctx.handle.id(), id = req.id, method = %req.method, "relay: control request");

        // Authenticate has its own deadline with a dedicated reply code.
        if req.method == api::AUTHENTICATE {
            return self.authenticate(ctx, &req).await;
        }
        match tokio::time::timeout(self.call_timeout, self.call(ctx, spec, &req)).await {
            Ok(d) => d,
            Err(_) => Dispatch {
                reply: RpcReply::error(req.id, format!("{} timed out", req.method)),
                action: Action::Close("call timeout".into()),
            },
        }
    }

    async fn call(&self, ctx: &mut ControlContext, spec: &MethodSpec, req: &RpcRequest) -> Dispatch {
        match (spec.namespace, spec.method) {
            ("RemoteProxy", "Hello") => self.hello(ctx, req),
            ("RemoteProxy", "Introspect") => Dispatch::ok(req.id, &api::introspect()),
            ("TunnelProxy", "RegisterServer") => self.register_server(ctx, req).await,
            ("TunnelProxy", "RegisterClient") => self.register_client(ctx, req).await,
            ("TunnelProxy", "DisconnectClient") => self.disconnect_client(ctx, req).await,
            ("TunnelProxy", "Ping") => match decode::<PingParams>(req) {
                Ok(p) => Dispatch::ok(req.id, &json!({ "timestamp": p.timestamp })),
                Err(err) => Dispatch::violation(req.id, &err),
            },
            _ => Dispatch::violation(req.id, &RpcError::UnknownMethod(req.method.clone())),
        }
    }

    fn hello(&self, ctx: &mut ControlContext, req: &RpcRequest) -> Dispatch {
        if ctx.state == RelayState::AwaitingHello {
            ctx.state = RelayState::Ready;
        }
        Dispatch::ok(
            req.id,
            &HelloReply {
                server: api::SERVER_IDENT.to_string(),
                name: self.server_name.clone(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                api_version: api::API_VERSION.to_string(),
            },
        )
    }

    async fn authenticate(&self, ctx: &mut ControlContext, req: &RpcRequest) -> Dispatch {
        if ctx.authenticated {
            return Dispatch::violation(req.id, &RpcError::NotAllowed(req.method.clone()));
        }
        let p: AuthenticateParams = match decode(req) {
            Ok(p) => p,
            Err(err) => return Dispatch::violation(req.id, &err),
        };
        let reply = |code: AuthenticationError, action: Action| {
            Dispatch::with(
                req.id,
                &AuthenticateReply {
                    authentication_error: code,
                },
                action,
            )
        };
        let Ok(uuid) = manager::parse_uuid(&p.uuid) else {
            return reply(
                AuthenticationError::AuthenticationFailed,
                Action::Close("authentication failed: invalid uuid".into()),
            );
        };

        let Some(authenticator) = &self.authenticator else {
            ctx.authenticated = true;
            ctx.identity = Some(PeerIdentity { uuid, name: p.name });
            return reply(AuthenticationError::NoError, Action::None);
        };

        let areq = AuthRequest {
            uuid,
            name: p.name.clone(),
            token: p.token,
            nonce: p.nonce,
        };
        let outcome =
            match tokio::time::timeout(self.auth_timeout, authenticator.authenticate(&areq)).await {
                Ok(o) => o,
                Err(_) => {
                    tracing::warn!(conn = %ctx.handle.id(), uuid = %uuid, "relay: authentication timed out");
                    return reply(
                        AuthenticationError::Timeout,
                        Action::Close("authentication timed out".into()),
                    );
                }
            };

        match outcome {
            AuthOutcome::Accepted { name } => {
                let name = name.unwrap_or(p.name);
                tracing::info!(conn = %ctx.handle.id(), uuid = %uuid, name = %name, authenticator = authenticator.kind(), "relay: authenticated");
                ctx.authenticated = true;
                ctx.identity = Some(PeerIdentity { uuid, name });
                reply(AuthenticationError::NoError, Action::None)
            }
            other => {
                tracing::warn!(conn = %ctx.handle.id(), uuid = %uuid, outcome = ?other, "relay: authentication refused");
                reply(other.error_code(), Action::Close("authentication failed".into()))
            }
        }
    }

    fn authentication_missing(&self, ctx: &ControlContext) -> bool {
        self.authenticator.is_some() && !ctx.authenticated
    }

    async fn register_server(&self, ctx: &mut ControlContext, req: &RpcRequest) -> Dispatch {
        let reply = |code: TunnelProxyError, slip: bool, action: Action| {
            Dispatch::with(
                req.id,
                &RegisterServerReply {
                    tunnel_proxy_error: code,
                    slip_enabled: slip,
                },
                action,
            )
        };
        match &ctx.binding {
            Some(Binding::Server(_)) => {
                return reply(TunnelProxyError::AlreadyRegistered, false, Action::None);
            }
            Some(Binding::Client { .. }) => {
                return role_redeclared(req.id, &RegisterServerReply {
                    tunnel_proxy_error: TunnelProxyError::AlreadyRegistered,
                    slip_enabled: false,
                });
            }
            None => {}
        }
        if self.authentication_missing(ctx) {
            return reply(
                TunnelProxyError::NotAuthenticated,
                false,
                Action::Close("not authenticated".into()),
            );
        }
        let p: RegisterServerParams = match decode(req) {
            Ok(p) => p,
            Err(err) => return Dispatch::violation(req.id, &err),
        };

        match self
            .manager
            .register_server(&ctx.handle, &p.server_uuid, &p.server_name)
            .await
        {
            Ok(session) => {
                ctx.binding = Some(Binding::Server(session));
                ctx.state = RelayState::Registered(PeerRole::Server);
                reply(TunnelProxyError::NoError, true, Action::EnterMultiplexing)
            }
            Err(TunnelProxyError::AlreadyRegistered) => reply(
                TunnelProxyError::AlreadyRegistered,
                false,
                Action::Close("server uuid already registered".into()),
            ),
            Err(code) => reply(code, false, Action::None),
        }
    }

    async fn register_client(&self, ctx: &mut ControlContext, req: &RpcRequest) -> Dispatch {
        let reply = |code: TunnelProxyError, action: Action| {
            Dispatch::with(
                req.id,
                &TunnelProxyReply {
                    tunnel_proxy_error: code,
                },
                action,
            )
        };
        match &ctx.binding {
            Some(Binding::Client { .. }) => {
                return reply(TunnelProxyError::AlreadyRegistered, Action::None);
            }
            Some(Binding::Server(_)) => {
                return role_redeclared(req.id, &TunnelProxyReply {
                    tunnel_proxy_error: TunnelProxyError::AlreadyRegistered,
                });
            }
            None => {}
        }
        if self.authentication_missing(ctx) {
            return reply(
                TunnelProxyError::NotAuthenticated,
                Action::Close("not authenticated".into()),
            );
        }
        let p: RegisterClientParams = match decode(req) {
            Ok(p) => p,
            Err(err) => return Dispatch::violation(req.id, &err),
        };

        match self
            .manager
            .register_client(&ctx.handle, &p.client_uuid, &p.client_name, &p.server_uuid)
            .await
        {
            Ok((session, address)) => {
                ctx.binding = Some(Binding::Client { session, address });
                ctx.state = RelayState::Registered(PeerRole::Client);
                reply(TunnelProxyError::NoError, Action::EnterRelaying)
            }
            Err(TunnelProxyError::AlreadyRegistered) => reply(
                TunnelProxyError::AlreadyRegistered,
                Action::Close("client uuid already bound".into()),
            ),
            Err(code) => reply(code, Action::None),
        }
    }

    async fn disconnect_client(&self, ctx: &mut ControlContext, req: &RpcRequest) -> Dispatch {
        let p: DisconnectClientParams = match decode(req) {
            Ok(p) => p,
            Err(err) => return Dispatch::violation(req.id, &err),
        };
        let code = match &ctx.binding {
            Some(Binding::Server(_)) => {
                match self
                    .manager
                    .disconnect_client(&ctx.handle, p.socket_address)
                    .await
                {
                    Ok(()) => TunnelProxyError::NoError,
                    Err(code) => code,
                }
            }
            _ => TunnelProxyError::NotRegistered,
        };
        Dispatch::ok(
            req.id,
            &TunnelProxyReply {
                tunnel_proxy_error: code,
            },
        )
    }
}

/// A connection holds one role for its lifetime; asking for the other one
/// is answered and then closed.
fn role_redeclared<T: Serialize>(id: i64, reply: &T) -> Dispatch {
    metrics::counter!("rendezvous_protocol_violations_total").increment(1);
    Dispatch::with(id, reply, Action::Close("role already declared".into()))
}

fn decode<T: DeserializeOwned>(req: &RpcRequest) -> Result<T, RpcError> {
    serde_json::from_value(Value::Object(req.params.clone()))
        .map_err(|e| RpcError::InvalidParams(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rendezvous::tunnel::{
        auth::MockAuthenticator,
        handle::{ConnectionId, Outbound},
    };
    use tokio::sync::mpsc;

    fn dispatcher(auth: Option<SharedAuthenticator>) -> ControlDispatcher {
        ControlDispatcher::new(
            Arc::new(RelayManager::new()),
            auth,
            "test-relay",
            Duration::from_secs(5),
            Duration::from_secs(8),
        )
    }

    fn ctx(n: u64) -> (ControlContext, mpsc::Receiver<Outbound>) {
        let (h, rx) = ConnectionHandle::new(ConnectionId(n), None, "test");
        let mut c = ControlContext::new(h);
        c.state = RelayState::AwaitingHello;
        (c, rx)
    }

    async fn send(d: &ControlDispatcher, c: &mut ControlContext, v: Value) -> Dispatch {
        d.dispatch(c, &serde_json::to_vec(&v).unwrap()).await
    }

    async fn hello(d: &ControlDispatcher, c: &mut ControlContext) {
        let r = send(d, c, json!({"id": 0, "method": "RemoteProxy.Hello"})).await;
        assert!(r.reply.is_success());
    }

    fn reply_field(d: &Dispatch, key: &str) -> Value {
        d.reply.params.as_ref().and_then(|p| p.get(key)).cloned().unwrap_or(Value::Null)
    }

    #[tokio::test]
    async fn hello_must_come_first() {
        let d = dispatcher(None);
        let (mut c, _rx) = ctx(1);
        let r = send(&d, &mut c, json!({"id": 1, "method": "TunnelProxy.Ping", "params": {"timestamp": 1}})).await;
        assert!(!r.reply.is_success());
        assert!(matches!(r.action, Action::Close(_)));

        let (mut c, _rx) = ctx(2);
        let r = send(&d, &mut c, json!({"id": 1, "method": "RemoteProxy.Introspect"})).await;
        assert!(r.reply.is_success());
        assert!(reply_field(&r, "methods").get("TunnelProxy.RegisterServer").is_some());

        let r = send(&d, &mut c, json!({"id": 2, "method": "RemoteProxy.Hello"})).await;
        assert_eq!(reply_field(&r, "server"), "rendezvous");
        assert_eq!(reply_field(&r, "name"), "test-relay");
        assert_eq!(reply_field(&r, "apiVersion"), api::API_VERSION);
        assert_eq!(c.state, RelayState::Ready);
    }

    #[tokio::test]
    async fn malformed_requests_close_with_best_known_id() {
        let d = dispatcher(None);
        let (mut c, _rx) = ctx(1);
        let r = d.dispatch(&mut c, b"{oops").await;
        assert_eq!(r.reply.id, rpc::UNKNOWN_ID);
        assert!(matches!(r.action, Action::Close(_)));

        let (mut c, _rx) = ctx(2);
        hello(&d, &mut c).await;
        for bad in [
            json!({"id": 7, "method": "Nope.Hello"}),
            json!({"id": 7, "method": "TunnelProxy.Nope"}),
            json!({"id": 7, "method": "TunnelProxy.Ping", "params": {}}),
            json!({"id": 7, "method": "TunnelProxy.Ping", "params": {"timestamp": 1, "extra": true}}),
        ] {
            let r = send(&d, &mut c, bad.clone()).await;
            assert_eq!(r.reply.id, 7, "{bad}");
            assert!(!r.reply.is_success(), "{bad}");
            assert!(matches!(r.action, Action::Close(_)), "{bad}");
        }
    }

    #[tokio::test]
    async fn ping_echoes_timestamp() {
        let d = dispatcher(None);
        let (mut c, _rx) = ctx(1);
        hello(&d, &mut c).await;
        let r = send(&d, &mut c, json!({"id": 3, "method": "TunnelProxy.Ping", "params": {"timestamp": 1234567}})).await;
        assert_eq!(r.reply.id, 3);
        assert_eq!(reply_field(&r, "timestamp"), 1234567);
        assert_eq!(r.action, Action::None);
    }

    #[tokio::test]
    async fn register_server_switches_to_multiplexing_once() {
        let d = dispatcher(None);
        let (mut c, _rx) = ctx(1);
        hello(&d, &mut c).await;
        let u = Uuid::new_v4().to_string();
        let req = json!({"id": 1, "method": "TunnelProxy.RegisterServer", "params": {"serverName": "s", "serverUuid": u}});

        let r = send(&d, &mut c, req.clone()).await;
        assert_eq!(reply_field(&r, "tunnelProxyError"), "TunnelProxyErrorNoError");
        assert_eq!(reply_field(&r, "slipEnabled"), true);
        assert_eq!(r.action, Action::EnterMultiplexing);
        assert_eq!(c.state, RelayState::Registered(PeerRole::Server));

        let r = send(&d, &mut c, req).await;
        assert_eq!(reply_field(&r, "tunnelProxyError"), "TunnelProxyErrorAlreadyRegistered");
        assert_eq!(r.action, Action::None);

        // A different connection claiming the same uuid is closed.
        let (mut other, _orx) = ctx(2);
        hello(&d, &mut other).await;
        let r = send(&d, &mut other, json!({"id": 1, "method": "TunnelProxy.RegisterServer", "params": {"serverName": "x", "serverUuid": u}})).await;
        assert_eq!(reply_field(&r, "tunnelProxyError"), "TunnelProxyErrorAlreadyRegistered");
        assert!(matches!(r.action, Action::Close(_)));
    }

    #[tokio::test]
    async fn server_connection_cannot_become_a_client() {
        let d = dispatcher(None);
        let (mut c, _rx) = ctx(1);
        hello(&d, &mut c).await;
        let u = Uuid::new_v4();
        let r = send(&d, &mut c, json!({"id": 1, "method": "TunnelProxy.RegisterServer", "params": {"serverName": "s", "serverUuid": u.to_string()}})).await;
        assert_eq!(r.action, Action::EnterMultiplexing);

        let r = send(&d, &mut c, json!({"id": 2, "method": "TunnelProxy.RegisterClient", "params": {
            "clientName": "c", "clientUuid": Uuid::new_v4().to_string(), "serverUuid": u.to_string()
        }})).await;
        assert_eq!(r.reply.id, 2);
        assert_eq!(reply_field(&r, "tunnelProxyError"), "TunnelProxyErrorAlreadyRegistered");
        assert!(matches!(r.action, Action::Close(_)));
    }

    #[tokio::test]
    async fn client_connection_cannot_become_a_server() {
        let d = dispatcher(None);
        let (mut s, _srx) = ctx(1);
        hello(&d, &mut s).await;
        let u = Uuid::new_v4();
        send(&d, &mut s, json!({"id": 1, "method": "TunnelProxy.RegisterServer", "params": {"serverName": "s", "serverUuid": u.to_string()}})).await;

        let (mut c, _crx) = ctx(2);
        hello(&d, &mut c).await;
        let r = send(&d, &mut c, json!({"id": 1, "method": "TunnelProxy.RegisterClient", "params": {
            "clientName": "c", "clientUuid": Uuid::new_v4().to_string(), "serverUuid": u.to_string()
        }})).await;
        assert_eq!(r.action, Action::EnterRelaying);

        let r = send(&d, &mut c, json!({"id": 2, "method": "TunnelProxy.RegisterServer", "params": {"serverName": "x", "serverUuid": Uuid::new_v4().to_string()}})).await;
        assert_eq!(reply_field(&r, "tunnelProxyError"), "TunnelProxyErrorAlreadyRegistered");
        assert!(matches!(r.action, Action::Close(_)));
        assert_eq!(d.manager().session_count().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn control_call_that_overruns_is_answered_with_an_error_and_closed() {
        let d = dispatcher(None);
        let (mut c, _rx) = ctx(1);
        hello(&d, &mut c).await;

        let gate = d.manager().clone();
        let blocker = tokio::spawn(async move { gate.hold_state_lock(Duration::from_secs(60)).await });
        tokio::task::yield_now().await;

        let r = send(&d, &mut c, json!({"id": 4, "method": "TunnelProxy.RegisterServer", "params": {
            "serverName": "s", "serverUuid": Uuid::new_v4().to_string()
        }})).await;
        assert_eq!(r.reply.id, 4);
        assert!(!r.reply.is_success());
        assert!(matches!(r.action, Action::Close(_)));
        assert!(c.binding.is_none());
        blocker.abort();
    }

    #[tokio::test]
    async fn invalid_uuid_is_an_error_code_not_a_violation() {
        let d = dispatcher(None);
        let (mut c, _rx) = ctx(1);
        hello(&d, &mut c).await;
        let r = send(&d, &mut c, json!({"id": 1, "method": "TunnelProxy.RegisterClient", "params": {
            "clientName": "c", "clientUuid": "nope", "serverUuid": Uuid::new_v4().to_string()
        }})).await;
        assert_eq!(reply_field(&r, "tunnelProxyError"), "TunnelProxyErrorInvalidUuid");
        assert_eq!(r.action, Action::None);

        let r = send(&d, &mut c, json!({"id": 2, "method": "TunnelProxy.RegisterClient", "params": {
            "clientName": "c", "clientUuid": Uuid::new_v4().to_string(), "serverUuid": Uuid::new_v4().to_string()
        }})).await;
        assert_eq!(reply_field(&r, "tunnelProxyError"), "TunnelProxyErrorServerNotFound");
    }

    #[tokio::test]
    async fn disconnect_client_from_non_server_is_not_registered() {
        let d = dispatcher(None);
        let (mut c, _rx) = ctx(1);
        hello(&d, &mut c).await;
        let r = send(&d, &mut c, json!({"id": 5, "method": "TunnelProxy.DisconnectClient", "params": {"socketAddress": 1}})).await;
        assert_eq!(reply_field(&r, "tunnelProxyError"), "TunnelProxyErrorNotRegistered");
    }

    #[tokio::test]
    async fn registration_requires_authentication_when_configured() {
        let mock = Arc::new(MockAuthenticator::accepting());
        let d = dispatcher(Some(mock.clone()));
        let (mut c, _rx) = ctx(1);
        hello(&d, &mut c).await;
        let r = send(&d, &mut c, json!({"id": 1, "method": "TunnelProxy.RegisterServer", "params": {
            "serverName": "s", "serverUuid": Uuid::new_v4().to_string()
        }})).await;
        assert_eq!(reply_field(&r, "tunnelProxyError"), "TunnelProxyErrorNotAuthenticated");
        assert!(matches!(r.action, Action::Close(_)));

        let (mut c, _rx) = ctx(2);
        hello(&d, &mut c).await;
        let r = send(&d, &mut c, json!({"id": 1, "method": "Authentication.Authenticate", "params": {
            "uuid": Uuid::new_v4().to_string(), "name": "peer", "token": "t"
        }})).await;
        assert_eq!(reply_field(&r, "authenticationError"), "AuthenticationErrorNoError");
        assert!(c.authenticated);
        assert_eq!(mock.calls(), 1);

        // A second Authenticate is not accepted.
        let r = send(&d, &mut c, json!({"id": 2, "method": "Authentication.Authenticate", "params": {
            "uuid": Uuid::new_v4().to_string(), "name": "peer", "token": "t"
        }})).await;
        assert!(matches!(r.action, Action::Close(_)));
    }

    #[tokio::test]
    async fn rejected_authentication_closes() {
        let d = dispatcher(Some(Arc::new(MockAuthenticator::rejecting())));
        let (mut c, _rx) = ctx(1);
        hello(&d, &mut c).await;
        let r = send(&d, &mut c, json!({"id": 1, "method": "Authentication.Authenticate", "params": {
            "uuid": Uuid::new_v4().to_string(), "name": "peer", "token": "bad"
        }})).await;
        assert!(r.reply.is_success());
        assert_eq!(reply_field(&r, "authenticationError"), "AuthenticationErrorAuthenticationFailed");
        assert!(matches!(r.action, Action::Close(_)));
        assert!(!c.authenticated);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_authenticator_times_out() {
        let slow = MockAuthenticator::accepting().with_delay(Duration::from_secs(60));
        let d = dispatcher(Some(Arc::new(slow)));
        let (mut c, _rx) = ctx(1);
        hello(&d, &mut c).await;
        let r = send(&d, &mut c, json!({"id": 1, "method": "Authentication.Authenticate", "params": {
            "uuid": Uuid::new_v4().to_string(), "name": "peer", "token": "t"
        }})).await;
        assert_eq!(reply_field(&r, "authenticationError"), "AuthenticationErrorTimeout");
        assert!(matches!(r.action, Action::Close(_)));
    }
}
