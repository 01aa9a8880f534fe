use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{HANDSHAKE_CLIENT_NAME, HANDSHAKE_CLIENT_VERSION, PROTOCOL_VERSION};

/// JSON-RPC error codes emitted by the bridge.
pub mod codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INTERNAL_ERROR: i64 = -32603;
    /// SDK extension codes used by MCP clients.
    pub const CONNECTION_CLOSED: i64 = -32000;
    pub const REQUEST_TIMEOUT: i64 = -32001;
}

pub const CANCELLED_METHOD: &str = "notifications/cancelled";
pub const INITIALIZE_METHOD: &str = "initialize";

/// A request/response identifier, preserved verbatim (string or number).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcId {
    Number(i64),
    String(String),
}

impl JsonRpcId {
    pub fn from_value(v: &Value) -> Option<Self> {
        match v {
            Value::Number(n) => n.as_i64().map(JsonRpcId::Number),
            Value::String(s) => Some(JsonRpcId::String(s.clone())),
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            JsonRpcId::Number(n) => Value::from(*n),
            JsonRpcId::String(s) => Value::from(s.as_str()),
        }
    }
}

impl std::fmt::Display for JsonRpcId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JsonRpcId::Number(n) => write!(f, "{n}"),
            JsonRpcId::String(s) => write!(f, "{s}"),
        }
    }
}

/// A JSON-RPC frame held as raw JSON.
///
/// The bridge routes on `id`, `method` and `error` only and forwards the
/// rest untouched; payloads are never validated or rewritten.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame(Value);

impl Frame {
    pub fn parse(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str::<Value>(line).map(Self)
    }

    pub fn from_value(v: Value) -> Self {
        Self(v)
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    /// The `id` member as received, excluding `null`.
    pub fn id_value(&self) -> Option<&Value> {
        self.0.get("id").filter(|v| !v.is_null())
    }

    pub fn id(&self) -> Option<JsonRpcId> {
        self.id_value().and_then(JsonRpcId::from_value)
    }

    pub fn method(&self) -> Option<&str> {
        self.0.get("method").and_then(Value::as_str)
    }

    pub fn params(&self) -> Option<&Value> {
        self.0.get("params")
    }

    pub fn is_error_response(&self) -> bool {
        self.0.get("error").is_some_and(|e| !e.is_null())
    }

    pub fn error_message(&self) -> Option<&str> {
        self.0.get("error")?.get("message")?.as_str()
    }

    /// True for the handshake request the supervisor replays on reconnect:
    /// `method == "initialize"` with `id == 0`.
    pub fn is_initialize_handshake(&self) -> bool {
        self.method() == Some(INITIALIZE_METHOD)
            && self.id() == Some(JsonRpcId::Number(0))
    }

    /// Compact serialization, one frame per line.
    pub fn to_line(&self) -> String {
        serde_json::to_string(&self.0).unwrap_or_else(|_| "{}".to_string())
    }
}

/// The canonical initialize handshake, byte-equivalent to what the local
/// client sends on startup.
pub fn initialize_handshake() -> Frame {
    Frame(serde_json::json!({
        "jsonrpc": "2.0",
        "id": 0,
        "method": INITIALIZE_METHOD,
        "params": {
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": HANDSHAKE_CLIENT_NAME,
                "version": HANDSHAKE_CLIENT_VERSION
            }
        }
    }))
}

/// A `notifications/cancelled` derivative for a server error response.
pub fn cancelled_notification(request_id: Value, reason: &str) -> Frame {
    Frame(serde_json::json!({
        "jsonrpc": "2.0",
        "method": CANCELLED_METHOD,
        "params": { "requestId": request_id, "reason": reason }
    }))
}

/// The best-effort cancellation sent upstream on shutdown.
pub fn shutdown_notification(now_ms: i64) -> Frame {
    Frame(serde_json::json!({
        "jsonrpc": "2.0",
        "method": CANCELLED_METHOD,
        "params": {
            "requestId": format!("shutdown-{now_ms}"),
            "reason": "Client shutting down"
        }
    }))
}

/// An error response frame. When no request id is known a string id
/// `error-<unixMs>` is synthesized; strict clients reject `id: null`.
pub fn error_frame(id: Option<JsonRpcId>, code: i64, message: &str, data: Value) -> Frame {
    let id = match id {
        Some(id) => id.to_value(),
        None => Value::from(format!("error-{}", chrono::Utc::now().timestamp_millis())),
    };
    Frame(serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message, "data": data }
    }))
}
