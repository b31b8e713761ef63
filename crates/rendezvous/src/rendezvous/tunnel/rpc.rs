use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Reply id used when the request id could not be read.
pub const UNKNOWN_ID: i64 = -1;

/// Longest newline-terminated control message accepted on an unframed stream.
pub const MAX_LINE_BYTES: usize = 1 << 20; // 1 MiB

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RpcError {
    #[error("invalid json: {0}")]
    InvalidJson(String),
    #[error("missing or non-integer 'id'")]
    MissingId,
    #[error("missing 'method'")]
    MissingMethod,
    #[error("malformed method name {0:?}")]
    MalformedMethod(String),
    #[error("unknown namespace {0:?}")]
    UnknownNamespace(String),
    #[error("unknown method {0:?}")]
    UnknownMethod(String),
    #[error("invalid params: {0}")]
    InvalidParams(String),
    #[error("method {0} is not allowed in the current connection state")]
    NotAllowed(String),
    #[error("control message exceeds {0} bytes")]
    LineTooLong(usize),
    #[error("unexpected message: {0}")]
    Unexpected(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub id: i64,
    pub method: String,
    #[serde(default)]
    pub params: Map<String, Value>,
}

impl RpcRequest {
    pub fn new(id: i64, method: &str, params: Value) -> Self {
        let params = match params {
            Value::Object(m) => m,
            _ => Map::new(),
        };
        Self {
            id,
            method: method.to_string(),
            params,
        }
    }

    /// Splits `"<Namespace>.<Method>"`.
    pub fn split_method(&self) -> Result<(&str, &str), RpcError> {
        let mut parts = self.method.split('.');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(ns), Some(m), None) if !ns.is_empty() && !m.is_empty() => Ok((ns, m)),
            _ => Err(RpcError::MalformedMethod(self.method.clone())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcReply {
    pub id: i64,
    pub status: ReplyStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RpcReply {
    pub fn success(id: i64, params: Value) -> Self {
        Self {
            id,
            status: ReplyStatus::Success,
            params: Some(params),
            error: None,
        }
    }

    pub fn error(id: i64, message: impl Into<String>) -> Self {
        Self {
            id,
            status: ReplyStatus::Error,
            params: None,
            error: Some(message.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ReplyStatus::Success
    }

    /// Deserializes the reply params, failing on error replies.
    pub fn into_params<T: serde::de::DeserializeOwned>(self) -> Result<T, RpcError> {
        if !self.is_success() {
            return Err(RpcError::Unexpected(
                self.error.unwrap_or_else(|| "error reply".into()),
            ));
        }
        let params = self.params.unwrap_or(Value::Object(Map::new()));
        serde_json::from_value(params).map_err(|e| RpcError::InvalidParams(e.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcNotification {
    pub id: i64,
    pub notification: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RpcMessage {
    Request(RpcRequest),
    Reply(RpcReply),
    Notification(RpcNotification),
}

fn parse_object(data: &[u8]) -> Result<Map<String, Value>, RpcError> {
    let v: Value = serde_json::from_slice(data).map_err(|e| RpcError::InvalidJson(e.to_string()))?;
    match v {
        Value::Object(m) => Ok(m),
        _ => Err(RpcError::InvalidJson("expected a json object".into())),
    }
}

/// Parses an inbound request. On failure the returned id is the request id
/// when it could be read, [`UNKNOWN_ID`] otherwise.
pub fn parse_request(data: &[u8]) -> Result<RpcRequest, (i64, RpcError)> {
    let mut obj = parse_object(data).map_err(|e| (UNKNOWN_ID, e))?;
    let id = obj
        .get("id")
        .and_then(Value::as_i64)
        .ok_or((UNKNOWN_ID, RpcError::MissingId))?;
    let method = match obj.remove("method") {
        Some(Value::String(s)) => s,
        _ => return Err((id, RpcError::MissingMethod)),
    };
    let params = match obj.remove("params") {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(m)) => m,
        Some(_) => {
            return Err((id, RpcError::InvalidParams("'params' must be an object".into())));
        }
    };
    Ok(RpcRequest { id, method, params })
}

/// Classifies any control-channel message by the keys it carries.
pub fn parse_message(data: &[u8]) -> Result<RpcMessage, RpcError> {
    let obj = parse_object(data)?;
    let v = Value::Object(obj);
    let de = |e: serde_json::Error| RpcError::InvalidJson(e.to_string());
    if v.get("notification").is_some() {
        return serde_json::from_value(v).map(RpcMessage::Notification).map_err(de);
    }
    if v.get("status").is_some() {
        return serde_json::from_value(v).map(RpcMessage::Reply).map_err(de);
    }
    if v.get("method").is_some() {
        return serde_json::from_value(v).map(RpcMessage::Request).map_err(de);
    }
    Err(RpcError::Unexpected("neither request, reply nor notification".into()))
}

/// JSON body without a terminator, as carried inside a control frame.
pub fn encode_payload<T: Serialize>(msg: &T) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(msg)
}

/// JSON body terminated by `\n`, as carried on an unframed stream.
pub fn encode_line<T: Serialize>(msg: &T) -> Result<Bytes, serde_json::Error> {
    let mut b = serde_json::to_vec(msg)?;
    b.push(b'\n');
    Ok(Bytes::from(b))
}

/// Splits an unframed control stream into newline-terminated messages.
#[derive(Debug)]
pub struct LineBuffer {
    buf: BytesMut,
    max: usize,
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::with_max(MAX_LINE_BYTES)
    }

    pub fn with_max(max: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max,
        }
    }

    pub fn feed(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Next non-blank line without its terminator.
    pub fn next_line(&mut self) -> Option<Result<Bytes, RpcError>> {
        loop {
            let Some(pos) = self.buf.iter().position(|&b| b == b'\n') else {
                if self.buf.len() > self.max {
                    self.buf.clear();
                    return Some(Err(RpcError::LineTooLong(self.max)));
                }
                return None;
            };
            let line = self.buf.split_to(pos + 1).freeze();
            let body = line.slice(..pos);
            if body.len() > self.max {
                return Some(Err(RpcError::LineTooLong(self.max)));
            }
            if body.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            return Some(Ok(body));
        }
    }

    /// Hands over whatever follows the last consumed line.
    pub fn take_remaining(&mut self) -> Bytes {
        self.buf.split().freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_request_reads_id_method_and_params() {
        let req = parse_request(br#"{"id": 4, "method": "TunnelProxy.Ping", "params": {"timestamp": 9}}"#)
            .unwrap();
        assert_eq!(req.id, 4);
        assert_eq!(req.split_method().unwrap(), ("TunnelProxy", "Ping"));
        assert_eq!(req.params.get("timestamp"), Some(&json!(9)));

        let bare = parse_request(br#"{"id": 1, "method": "RemoteProxy.Hello"}"#).unwrap();
        assert!(bare.params.is_empty());
    }

    #[test]
    fn parse_request_failures_carry_best_known_id() {
        assert_eq!(parse_request(b"not json").unwrap_err().0, UNKNOWN_ID);
        assert_eq!(
            parse_request(br#"{"method": "RemoteProxy.Hello"}"#).unwrap_err(),
            (UNKNOWN_ID, RpcError::MissingId)
        );
        assert_eq!(
            parse_request(br#"{"id": 3}"#).unwrap_err(),
            (3, RpcError::MissingMethod)
        );
        assert!(matches!(
            parse_request(br#"{"id": 3, "method": "A.B", "params": [1]}"#).unwrap_err(),
            (3, RpcError::InvalidParams(_))
        ));
    }

    #[test]
    fn method_names_need_exactly_two_parts() {
        for bad in ["Hello", "A.B.C", ".Hello", "RemoteProxy."] {
            let req = RpcRequest::new(1, bad, json!({}));
            assert!(matches!(req.split_method(), Err(RpcError::MalformedMethod(_))), "{bad}");
        }
    }

    #[test]
    fn reply_wire_shape() {
        let ok = serde_json::to_value(RpcReply::success(2, json!({"timestamp": 5}))).unwrap();
        assert_eq!(ok, json!({"id": 2, "status": "success", "params": {"timestamp": 5}}));

        let err = serde_json::to_value(RpcReply::error(2, "boom")).unwrap();
        assert_eq!(err, json!({"id": 2, "status": "error", "error": "boom"}));
    }

    #[test]
    fn parse_message_classifies() {
        let n = parse_message(br#"{"id": 1, "notification": "TunnelProxy.ClientDisconnected", "params": {"socketAddress": 3}}"#).unwrap();
        assert!(matches!(n, RpcMessage::Notification(ref n) if n.notification == "TunnelProxy.ClientDisconnected"));

        let r = parse_message(br#"{"id": 1, "status": "error", "error": "x"}"#).unwrap();
        assert!(matches!(r, RpcMessage::Reply(ref r) if !r.is_success()));

        assert!(parse_message(br#"{"id": 1}"#).is_err());
    }

    #[test]
    fn line_buffer_splits_skips_blank_and_keeps_tail() {
        let mut lb = LineBuffer::new();
        lb.feed(b"\n  \n{\"id\":1}\n{\"id\"");
        assert_eq!(lb.next_line().unwrap().unwrap(), Bytes::from_static(b"{\"id\":1}"));
        assert!(lb.next_line().is_none());
        lb.feed(b":2}\nraw-bytes");
        assert_eq!(lb.next_line().unwrap().unwrap(), Bytes::from_static(b"{\"id\":2}"));
        assert!(lb.next_line().is_none());
        assert_eq!(lb.take_remaining(), Bytes::from_static(b"raw-bytes"));
    }

    #[test]
    fn line_buffer_bounds_unterminated_input() {
        let mut lb = LineBuffer::with_max(4);
        lb.feed(b"12345");
        assert_eq!(lb.next_line(), Some(Err(RpcError::LineTooLong(4))));
    }
}
