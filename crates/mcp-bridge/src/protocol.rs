//! JSON-RPC 2.0 framing and MCP message typing.
//!
//! Every wire message is one of four shapes: request, successful response,
//! error response, or notification. Parsing is tolerant of unknown fields but
//! rejects messages that lack `jsonrpc` or carry both `result` and `error`.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON-RPC version tag carried by every message.
pub const JSONRPC_VERSION: &str = "2.0";

/// MCP protocol revision this bridge speaks by default.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// JSON-RPC error codes.
pub mod codes {
    /// Malformed JSON.
    pub const PARSE_ERROR: i64 = -32700;
    /// Message violates the JSON-RPC shape.
    pub const INVALID_REQUEST: i64 = -32600;
    /// Unknown or unroutable method.
    pub const METHOD_NOT_FOUND: i64 = -32601;
    /// Params rejected.
    pub const INVALID_PARAMS: i64 = -32602;
    /// Internal error.
    pub const INTERNAL_ERROR: i64 = -32603;
    /// First server-defined code; the bridge uses it for synthetic errors
    /// (timeouts, unavailable backends).
    pub const SERVER_ERROR: i64 = -32000;
}

/// MCP method names the bridge recognizes. Anything else is pass-through.
pub mod methods {
    pub const INITIALIZE: &str = "initialize";
    pub const PING: &str = "ping";
    pub const TOOLS_LIST: &str = "tools/list";
    pub const TOOLS_CALL: &str = "tools/call";
    pub const RESOURCES_LIST: &str = "resources/list";
    pub const RESOURCES_TEMPLATES_LIST: &str = "resources/templates/list";
    pub const RESOURCES_READ: &str = "resources/read";
    pub const RESOURCES_SUBSCRIBE: &str = "resources/subscribe";
    pub const RESOURCES_UNSUBSCRIBE: &str = "resources/unsubscribe";
    pub const PROMPTS_LIST: &str = "prompts/list";
    pub const PROMPTS_GET: &str = "prompts/get";
    pub const LOGGING_SET_LEVEL: &str = "logging/setLevel";
    pub const COMPLETION_COMPLETE: &str = "completion/complete";

    pub const NOTIF_INITIALIZED: &str = "notifications/initialized";
    pub const NOTIF_CANCELLED: &str = "notifications/cancelled";
    pub const NOTIF_PROGRESS: &str = "notifications/progress";
    pub const NOTIF_MESSAGE: &str = "notifications/message";
    pub const NOTIF_TOOLS_CHANGED: &str = "notifications/tools/list_changed";
    pub const NOTIF_RESOURCES_CHANGED: &str = "notifications/resources/list_changed";
    pub const NOTIF_RESOURCES_UPDATED: &str = "notifications/resources/updated";
    pub const NOTIF_PROMPTS_CHANGED: &str = "notifications/prompts/list_changed";
}

/// Request id: string or integer, unique per originator per session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s}"),
        }
    }
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        Self::Number(n)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

/// JSON-RPC error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    #[must_use]
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), data: None }
    }

    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// `-32601` for an unknown or unroutable method or name.
    #[must_use]
    pub fn method_not_found(method: &str) -> Self {
        Self::new(codes::METHOD_NOT_FOUND, format!("Method not found: {method}"))
    }

    #[must_use]
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(codes::INVALID_REQUEST, message)
    }

    #[must_use]
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(codes::INVALID_PARAMS, message)
    }

    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(codes::INTERNAL_ERROR, message)
    }

    /// Synthetic `-32000` for a request that outlived its budget.
    #[must_use]
    pub fn timeout(server: &str) -> Self {
        Self::new(codes::SERVER_ERROR, "request timed out")
            .with_data(serde_json::json!({ "timeout": true, "server": server }))
    }

    /// Synthetic `-32000` for a backend that is failed or gone.
    #[must_use]
    pub fn backend_unavailable(server: &str, reason: impl Into<String>) -> Self {
        Self::new(codes::SERVER_ERROR, "backend unavailable").with_data(serde_json::json!({
            "unavailable": true,
            "server": server,
            "reason": reason.into(),
        }))
    }

    /// True when the code means the peer simply lacks the method, which the
    /// capability probe treats as "capability absent", not a failure.
    #[must_use]
    pub fn is_method_not_found(&self) -> bool {
        self.code == codes::METHOD_NOT_FOUND
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "JSON-RPC error {}: {}", self.code, self.message)
    }
}

/// Request: carries an id the originator expects to see answered.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: RequestId,
    pub method: String,
    pub params: Option<Value>,
}

impl Request {
    #[must_use]
    pub fn new(id: impl Into<RequestId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self { id: id.into(), method: method.into(), params }
    }
}

/// Fire-and-forget message, no id.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub method: String,
    pub params: Option<Value>,
}

impl Notification {
    #[must_use]
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self { method: method.into(), params }
    }
}

/// Either a result or an error, never both.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponsePayload {
    Result(Value),
    Error(RpcError),
}

/// Response to a request, correlated by id.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: RequestId,
    pub payload: ResponsePayload,
}

impl Response {
    #[must_use]
    pub fn ok(id: RequestId, result: Value) -> Self {
        Self { id, payload: ResponsePayload::Result(result) }
    }

    #[must_use]
    pub fn err(id: RequestId, error: RpcError) -> Self {
        Self { id, payload: ResponsePayload::Error(error) }
    }

    /// Borrow the payload as a `Result`.
    pub fn result(&self) -> Result<&Value, &RpcError> {
        match &self.payload {
            ResponsePayload::Result(v) => Ok(v),
            ResponsePayload::Error(e) => Err(e),
        }
    }

    /// Consume into a `Result`.
    pub fn into_result(self) -> Result<Value, RpcError> {
        match self.payload {
            ResponsePayload::Result(v) => Ok(v),
            ResponsePayload::Error(e) => Err(e),
        }
    }
}

/// A message that violated the JSON-RPC 2.0 shape.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("missing or unsupported jsonrpc version")]
    BadVersion,
    #[error("message carries both result and error")]
    ResultAndError,
    #[error("message is neither request, response, nor notification")]
    Unclassifiable,
}

/// Wire-level view used for (de)serialization; `Message` enforces the shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawMessage {
    jsonrpc: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<RequestId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<RpcError>,
}

/// Classified JSON-RPC message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawMessage", into = "RawMessage")]
pub enum Message {
    Request(Request),
    Response(Response),
    Notification(Notification),
}

impl Message {
    /// Parse one frame. Shape violations surface as `serde` errors carrying
    /// the matching [`FrameError`] text.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Serialize to a single JSON line (no trailing newline).
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Method name for requests and notifications.
    #[must_use]
    pub fn method(&self) -> Option<&str> {
        match self {
            Self::Request(r) => Some(&r.method),
            Self::Notification(n) => Some(&n.method),
            Self::Response(_) => None,
        }
    }

    /// Id for requests and responses.
    #[must_use]
    pub fn id(&self) -> Option<&RequestId> {
        match self {
            Self::Request(r) => Some(&r.id),
            Self::Response(r) => Some(&r.id),
            Self::Notification(_) => None,
        }
    }
}

impl TryFrom<RawMessage> for Message {
    type Error = FrameError;

    fn try_from(raw: RawMessage) -> Result<Self, FrameError> {
        if raw.jsonrpc.as_deref() != Some(JSONRPC_VERSION) {
            return Err(FrameError::BadVersion);
        }
        if raw.result.is_some() && raw.error.is_some() {
            return Err(FrameError::ResultAndError);
        }
        match (raw.method, raw.id, raw.result, raw.error) {
            (Some(method), Some(id), None, None) => {
                Ok(Self::Request(Request { id, method, params: raw.params }))
            }
            (Some(method), None, None, None) => {
                Ok(Self::Notification(Notification { method, params: raw.params }))
            }
            (None, Some(id), Some(result), None) => Ok(Self::Response(Response::ok(id, result))),
            (None, Some(id), None, Some(error)) => Ok(Self::Response(Response::err(id, error))),
            _ => Err(FrameError::Unclassifiable),
        }
    }
}

impl From<Message> for RawMessage {
    fn from(msg: Message) -> Self {
        let mut raw = Self {
            jsonrpc: Some(JSONRPC_VERSION.to_string()),
            id: None,
            method: None,
            params: None,
            result: None,
            error: None,
        };
        match msg {
            Message::Request(r) => {
                raw.id = Some(r.id);
                raw.method = Some(r.method);
                raw.params = r.params;
            }
            Message::Notification(n) => {
                raw.method = Some(n.method);
                raw.params = n.params;
            }
            Message::Response(r) => {
                raw.id = Some(r.id);
                match r.payload {
                    ResponsePayload::Result(v) => raw.result = Some(v),
                    ResponsePayload::Error(e) => raw.error = Some(e),
                }
            }
        }
        raw
    }
}

impl From<Request> for Message {
    fn from(r: Request) -> Self {
        Self::Request(r)
    }
}

impl From<Response> for Message {
    fn from(r: Response) -> Self {
        Self::Response(r)
    }
}

impl From<Notification> for Message {
    fn from(n: Notification) -> Self {
        Self::Notification(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_request() {
        let msg = Message::parse(r#"{"jsonrpc":"2.0","id":1,"method":"tools/list"}"#).unwrap();
        match msg {
            Message::Request(r) => {
                assert_eq!(r.id, RequestId::Number(1));
                assert_eq!(r.method, "tools/list");
                assert!(r.params.is_none());
            }
            other => panic!("expected request, got {other:?}"),
        }
    }

    #[test]
    fn parses_string_id() {
        let msg = Message::parse(r#"{"jsonrpc":"2.0","id":"a-7","method":"ping"}"#).unwrap();
        assert_eq!(msg.id(), Some(&RequestId::String("a-7".into())));
    }

    #[test]
    fn parses_notification() {
        let msg =
            Message::parse(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#).unwrap();
        assert!(matches!(msg, Message::Notification(_)));
        assert_eq!(msg.method(), Some(methods::NOTIF_INITIALIZED));
    }

    #[test]
    fn parses_error_response() {
        let msg = Message::parse(
            r#"{"jsonrpc":"2.0","id":3,"error":{"code":-32601,"message":"nope"}}"#,
        )
        .unwrap();
        match msg {
            Message::Response(r) => {
                let err = r.result().unwrap_err();
                assert_eq!(err.code, codes::METHOD_NOT_FOUND);
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn rejects_missing_version() {
        assert!(Message::parse(r#"{"id":1,"method":"ping"}"#).is_err());
        assert!(Message::parse(r#"{"jsonrpc":"1.0","id":1,"method":"ping"}"#).is_err());
    }

    #[test]
    fn rejects_result_and_error() {
        let text = r#"{"jsonrpc":"2.0","id":1,"result":{},"error":{"code":1,"message":"x"}}"#;
        assert!(Message::parse(text).is_err());
    }

    #[test]
    fn tolerates_unknown_fields() {
        let text = r#"{"jsonrpc":"2.0","id":1,"method":"ping","_meta":{"x":1},"extra":true}"#;
        assert!(Message::parse(text).is_ok());
    }

    #[test]
    fn round_trips_request() {
        let msg: Message =
            Request::new(7, "tools/call", Some(json!({"name":"echo","arguments":{"x":"hi"}})))
                .into();
        let text = msg.to_json().unwrap();
        assert_eq!(Message::parse(&text).unwrap(), msg);
    }

    #[test]
    fn serializes_error_without_result_key() {
        let msg: Message =
            Response::err(RequestId::Number(1), RpcError::method_not_found("x")).into();
        let text = msg.to_json().unwrap();
        assert!(!text.contains("\"result\""));
        assert!(text.contains("\"error\""));
    }

    #[test]
    fn synthetic_errors_name_the_server() {
        let err = RpcError::backend_unavailable("echo", "session closed");
        let data = err.data.unwrap();
        assert_eq!(data["server"], "echo");
        assert_eq!(data["unavailable"], true);

        let err = RpcError::timeout("slow");
        assert_eq!(err.data.unwrap()["timeout"], true);
    }
}
