//! Control-channel API: the statically declared method table, wire enums and
//! typed params for every call.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::rendezvous::tunnel::rpc::RpcError;

pub const SERVER_IDENT: &str = "rendezvous";
pub const API_VERSION: &str = "1.0";

pub const HELLO: &str = "RemoteProxy.Hello";
pub const INTROSPECT: &str = "RemoteProxy.Introspect";
pub const AUTHENTICATE: &str = "Authentication.Authenticate";
pub const REGISTER_SERVER: &str = "TunnelProxy.RegisterServer";
pub const REGISTER_CLIENT: &str = "TunnelProxy.RegisterClient";
pub const DISCONNECT_CLIENT: &str = "TunnelProxy.DisconnectClient";
pub const PING: &str = "TunnelProxy.Ping";
pub const CLIENT_CONNECTED: &str = "TunnelProxy.ClientConnected";
pub const CLIENT_DISCONNECTED: &str = "TunnelProxy.ClientDisconnected";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, thiserror::Error)]
pub enum TunnelProxyError {
    #[serde(rename = "TunnelProxyErrorNoError")]
    #[error("no error")]
    NoError,
    #[serde(rename = "TunnelProxyErrorUnknownError")]
    #[error("unknown error")]
    UnknownError,
    #[serde(rename = "TunnelProxyErrorInternalServerError")]
    #[error("internal server error")]
    InternalServerError,
    #[serde(rename = "TunnelProxyErrorInvalidUuid")]
    #[error("invalid uuid")]
    InvalidUuid,
    #[serde(rename = "TunnelProxyErrorServerNotFound")]
    #[error("server not found")]
    ServerNotFound,
    #[serde(rename = "TunnelProxyErrorAlreadyRegistered")]
    #[error("already registered")]
    AlreadyRegistered,
    #[serde(rename = "TunnelProxyErrorNotRegistered")]
    #[error("not registered as server")]
    NotRegistered,
    #[serde(rename = "TunnelProxyErrorInvalidSocketAddress")]
    #[error("invalid socket address")]
    InvalidSocketAddress,
    #[serde(rename = "TunnelProxyErrorNotAuthenticated")]
    #[error("not authenticated")]
    NotAuthenticated,
    #[serde(rename = "TunnelProxyErrorCapacityExhausted")]
    #[error("address space exhausted")]
    CapacityExhausted,
}

impl TunnelProxyError {
    pub const ALL: &'static [&'static str] = &[
        "TunnelProxyErrorNoError",
        "TunnelProxyErrorUnknownError",
        "TunnelProxyErrorInternalServerError",
        "TunnelProxyErrorInvalidUuid",
        "TunnelProxyErrorServerNotFound",
        "TunnelProxyErrorAlreadyRegistered",
        "TunnelProxyErrorNotRegistered",
        "TunnelProxyErrorInvalidSocketAddress",
        "TunnelProxyErrorNotAuthenticated",
        "TunnelProxyErrorCapacityExhausted",
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, thiserror::Error)]
pub enum AuthenticationError {
    #[serde(rename = "AuthenticationErrorNoError")]
    #[error("no error")]
    NoError,
    #[serde(rename = "AuthenticationErrorUnknown")]
    #[error("unknown authentication error")]
    Unknown,
    #[serde(rename = "AuthenticationErrorTimeout")]
    #[error("authentication timed out")]
    Timeout,
    #[serde(rename = "AuthenticationErrorAborted")]
    #[error("authentication aborted")]
    Aborted,
    #[serde(rename = "AuthenticationErrorAuthenticationFailed")]
    #[error("authentication failed")]
    AuthenticationFailed,
}

impl AuthenticationError {
    pub const ALL: &'static [&'static str] = &[
        "AuthenticationErrorNoError",
        "AuthenticationErrorUnknown",
        "AuthenticationErrorTimeout",
        "AuthenticationErrorAborted",
        "AuthenticationErrorAuthenticationFailed",
    ];
}

// --- Params / returns ---

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloReply {
    pub server: String,
    pub name: String,
    pub version: String,
    pub api_version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticateParams {
    pub uuid: String,
    pub name: String,
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticateReply {
    pub authentication_error: AuthenticationError,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterServerParams {
    pub server_name: String,
    pub server_uuid: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterServerReply {
    pub tunnel_proxy_error: TunnelProxyError,
    pub slip_enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterClientParams {
    pub client_name: String,
    pub client_uuid: String,
    pub server_uuid: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelProxyReply {
    pub tunnel_proxy_error: TunnelProxyError,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisconnectClientParams {
    pub socket_address: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingParams {
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConnectedParams {
    pub client_name: String,
    pub client_uuid: String,
    pub client_peer_address: String,
    pub socket_address: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientDisconnectedParams {
    pub socket_address: u16,
}

// --- Method table ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    String,
    Uuid,
    Int,
    Uint16,
    Bool,
    Object,
    Enum(&'static str),
}

impl ParamType {
    fn type_name(&self) -> &'static str {
        match self {
            ParamType::String => "String",
            ParamType::Uuid => "Uuid",
            ParamType::Int => "Int",
            ParamType::Uint16 => "Uint",
            ParamType::Bool => "Bool",
            ParamType::Object => "Object",
            ParamType::Enum(name) => *name,
        }
    }

    fn accepts(&self, v: &Value) -> bool {
        match self {
            // Uuid syntax is checked by the handler so it can answer InvalidUuid.
            ParamType::String | ParamType::Uuid => v.is_string(),
            ParamType::Int => v.is_i64(),
            ParamType::Uint16 => v.as_u64().is_some_and(|n| n <= u16::MAX as u64),
            ParamType::Bool => v.is_boolean(),
            ParamType::Object => v.is_object(),
            ParamType::Enum(name) => v
                .as_str()
                .is_some_and(|s| enum_values(name).is_some_and(|vals| vals.contains(&s))),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ParamSpec {
    pub name: &'static str,
    pub ty: ParamType,
    pub optional: bool,
}

const fn req(name: &'static str, ty: ParamType) -> ParamSpec {
    ParamSpec {
        name,
        ty,
        optional: false,
    }
}

const fn opt(name: &'static str, ty: ParamType) -> ParamSpec {
    ParamSpec {
        name,
        ty,
        optional: true,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MethodSpec {
    pub namespace: &'static str,
    pub method: &'static str,
    pub description: &'static str,
    pub params: &'static [ParamSpec],
    pub returns: &'static [ParamSpec],
}

impl MethodSpec {
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.namespace, self.method)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct NotificationSpec {
    pub namespace: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub params: &'static [ParamSpec],
}

pub const METHODS: &[MethodSpec] = &[
    MethodSpec {
        namespace: "RemoteProxy",
        method: "Hello",
        description: "Greet the relay. Must be the first call on every connection.",
        params: &[],
        returns: &[
            req("server", ParamType::String),
            req("name", ParamType::String),
            req("version", ParamType::String),
            req("apiVersion", ParamType::String),
        ],
    },
    MethodSpec {
        namespace: "RemoteProxy",
        method: "Introspect",
        description: "Describe every method, type and notification of this API.",
        params: &[],
        returns: &[
            req("methods", ParamType::Object),
            req("types", ParamType::Object),
            req("notifications", ParamType::Object),
        ],
    },
    MethodSpec {
        namespace: "Authentication",
        method: "Authenticate",
        description: "Authenticate this connection with a token (and optional nonce).",
        params: &[
            req("uuid", ParamType::Uuid),
            req("name", ParamType::String),
            req("token", ParamType::String),
            opt("nonce", ParamType::String),
        ],
        returns: &[req("authenticationError", ParamType::Enum("AuthenticationError"))],
    },
    MethodSpec {
        namespace: "TunnelProxy",
        method: "RegisterServer",
        description: "Register this connection as tunnel server. On success all further traffic is SLIP framed.",
        params: &[
            req("serverName", ParamType::String),
            req("serverUuid", ParamType::Uuid),
        ],
        returns: &[
            req("tunnelProxyError", ParamType::Enum("TunnelProxyError")),
            req("slipEnabled", ParamType::Bool),
        ],
    },
    MethodSpec {
        namespace: "TunnelProxy",
        method: "RegisterClient",
        description: "Register this connection as tunnel client of the given server. On success all further traffic is relayed raw.",
        params: &[
            req("clientName", ParamType::String),
            req("clientUuid", ParamType::Uuid),
            req("serverUuid", ParamType::Uuid),
        ],
        returns: &[req("tunnelProxyError", ParamType::Enum("TunnelProxyError"))],
    },
    MethodSpec {
        namespace: "TunnelProxy",
        method: "DisconnectClient",
        description: "Close the client bound to the given socket address. Server connections only.",
        params: &[req("socketAddress", ParamType::Uint16)],
        returns: &[req("tunnelProxyError", ParamType::Enum("TunnelProxyError"))],
    },
    MethodSpec {
        namespace: "TunnelProxy",
        method: "Ping",
        description: "Echo the given timestamp.",
        params: &[req("timestamp", ParamType::Int)],
        returns: &[req("timestamp", ParamType::Int)],
    },
];

pub const NOTIFICATIONS: &[NotificationSpec] = &[
    NotificationSpec {
        namespace: "TunnelProxy",
        name: "ClientConnected",
        description: "A client registered against this server and was bound to socketAddress.",
        params: &[
            req("clientName", ParamType::String),
            req("clientUuid", ParamType::Uuid),
            req("clientPeerAddress", ParamType::String),
            req("socketAddress", ParamType::Uint16),
        ],
    },
    NotificationSpec {
        namespace: "TunnelProxy",
        name: "ClientDisconnected",
        description: "The client bound to socketAddress went away.",
        params: &[req("socketAddress", ParamType::Uint16)],
    },
];

fn enum_values(name: &str) -> Option<&'static [&'static str]> {
    match name {
        "TunnelProxyError" => Some(TunnelProxyError::ALL),
        "AuthenticationError" => Some(AuthenticationError::ALL),
        _ => None,
    }
}

pub fn find_method(namespace: &str, method: &str) -> Result<&'static MethodSpec, RpcError> {
    if !METHODS.iter().any(|m| m.namespace == namespace) {
        return Err(RpcError::UnknownNamespace(namespace.to_string()));
    }
    METHODS
        .iter()
        .find(|m| m.namespace == namespace && m.method == method)
        .ok_or_else(|| RpcError::UnknownMethod(format!("{namespace}.{method}")))
}

/// Checks `params` against the declared shape: required keys present, every
/// key known, every value of the declared type.
pub fn validate_params(spec: &MethodSpec, params: &Map<String, Value>) -> Result<(), RpcError> {
    for p in spec.params {
        match params.get(p.name) {
            None | Some(Value::Null) if p.optional => {}
            None => {
                return Err(RpcError::InvalidParams(format!("missing '{}'", p.name)));
            }
            Some(v) if !p.ty.accepts(v) => {
                return Err(RpcError::InvalidParams(format!(
                    "'{}' must be {}",
                    p.name,
                    p.ty.type_name()
                )));
            }
            Some(_) => {}
        }
    }
    if let Some(extra) = params
        .keys()
        .find(|k| !spec.params.iter().any(|p| p.name == k.as_str()))
    {
        return Err(RpcError::InvalidParams(format!("unexpected '{extra}'")));
    }
    Ok(())
}

fn describe_params(params: &[ParamSpec]) -> Value {
    let mut m = Map::new();
    for p in params {
        let key = if p.optional {
            format!("o:{}", p.name)
        } else {
            p.name.to_string()
        };
        m.insert(key, Value::String(p.ty.type_name().to_string()));
    }
    Value::Object(m)
}

/// `RemoteProxy.Introspect` reply params.
pub fn introspect() -> Value {
    let mut methods = Map::new();
    for m in METHODS {
        methods.insert(
            m.full_name(),
            json!({
                "description": m.description,
                "params": describe_params(m.params),
                "returns": describe_params(m.returns),
            }),
        );
    }

    let mut notifications = Map::new();
    for n in NOTIFICATIONS {
        notifications.insert(
            format!("{}.{}", n.namespace, n.name),
            json!({
                "description": n.description,
                "params": describe_params(n.params),
            }),
        );
    }

    json!({
        "methods": methods,
        "types": {
            "TunnelProxyError": TunnelProxyError::ALL,
            "AuthenticationError": AuthenticationError::ALL,
        },
        "notifications": notifications,
    })
}
