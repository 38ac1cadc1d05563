//! Wire protocol types for host-worker communication.
//!
//! Host → worker: JSON-RPC 2.0 requests, one per line.
//! Worker → host: a one-time ready signal, responses and notifications.
//!
//! Inbound lines are classified by [`classify`] in a fixed priority order:
//! ready signal, then response, then notification. Anything else is
//! unclassifiable and dropped by the caller.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";

/// Value of the `status` key in the ready signal.
pub const READY_STATUS: &str = "ready";

/// Per-connection request identifier. Never reused.
pub type RequestId = u64;

/// Outbound request envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub jsonrpc: String,
    pub id: RequestId,
    pub method: String,
    pub params: Value,
}

impl Request {
    /// Build a request. `null` params are sent as an empty object.
    pub fn new(id: RequestId, method: impl Into<String>, params: Value) -> Self {
        let params = match params {
            Value::Null => Value::Object(serde_json::Map::new()),
            other => other,
        };
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: method.into(),
            params,
        }
    }

    /// Serialize to a single wire line (without the trailing newline).
    pub fn to_line(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Error descriptor carried by a failed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl std::fmt::Display for RemoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.code {
            Some(code) => write!(f, "{} (code {})", self.message, code),
            None => f.write_str(&self.message),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: RequestId,
    pub outcome: Result<Value, RemoteError>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// A classified inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Ready,
    Response(Response),
    Notification(Notification),
}

/// Why a parsed line could not be used.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid JSON: {0}")]
    InvalidJson(String),
    #[error("unrecognized message shape")]
    Unclassified,
    #[error("malformed error descriptor: {0}")]
    InvalidErrorDescriptor(String),
}

/// Parse and classify one wire line.
pub fn decode_line(line: &str) -> Result<InboundMessage, DecodeError> {
    let value: Value =
        serde_json::from_str(line).map_err(|e| DecodeError::InvalidJson(e.to_string()))?;
    classify(value)
}

/// Classify a parsed value. First matching rule wins.
pub fn classify(value: Value) -> Result<InboundMessage, DecodeError> {
    let Value::Object(mut obj) = value else {
        return Err(DecodeError::Unclassified);
    };

    if obj.get("status").and_then(Value::as_str) == Some(READY_STATUS) {
        return Ok(InboundMessage::Ready);
    }

    let is_rpc = obj.get("jsonrpc").and_then(Value::as_str) == Some(JSONRPC_VERSION);
    if is_rpc && let Some(id) = obj.get("id").and_then(Value::as_u64) {
        // An error descriptor wins over a result if a worker sends both.
        let outcome = match obj.remove("error") {
            Some(Value::Null) | None => Ok(obj.remove("result").unwrap_or(Value::Null)),
            Some(error) => Err(serde_json::from_value::<RemoteError>(error)
                .map_err(|e| DecodeError::InvalidErrorDescriptor(e.to_string()))?),
        };
        return Ok(InboundMessage::Response(Response { id, outcome }));
    }

    if !obj.contains_key("id")
        && let Some(Value::String(method)) = obj.remove("method")
    {
        let params = obj.remove("params").unwrap_or(Value::Null);
        return Ok(InboundMessage::Notification(Notification { method, params }));
    }

    Err(DecodeError::Unclassified)
}
