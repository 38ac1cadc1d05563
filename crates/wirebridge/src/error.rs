//! Error types for the bridge.

use std::time::Duration;

use crate::bridge::protocol::RemoteError;
use crate::state::{ConnectionState, DisconnectReason};

/// Errors surfaced to bridge callers.
///
/// Clone so one failure can be fanned out to every waiting caller.
/// Malformed worker output is never turned into one of these; it is logged
/// and published as a `BridgeEvent` instead.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BridgeError {
    #[error("bridge not connected (state: {0})")]
    NotConnected(ConnectionState),

    #[error("cannot connect while {0}")]
    InvalidState(ConnectionState),

    #[error("method name must not be empty")]
    InvalidMethod,

    #[error("worker did not signal ready within {0:?}")]
    ConnectTimeout(Duration),

    #[error("request timeout: {method} (no response within {timeout:?})")]
    RequestTimeout { method: String, timeout: Duration },

    #[error("remote error: {0}")]
    Remote(RemoteError),

    #[error("disconnected: {0}")]
    Disconnected(DisconnectReason),

    #[error("failed to spawn worker: {0}")]
    Spawn(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid params: {0}")]
    InvalidParams(String),

    #[error("failed to decode result: {0}")]
    Decode(String),
}

impl BridgeError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::RequestTimeout { .. } | Self::ConnectTimeout(_))
    }

    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::Disconnected(_))
    }
}

impl From<RemoteError> for BridgeError {
    fn from(err: RemoteError) -> Self {
        Self::Remote(err)
    }
}

/// Result type alias for this crate.
pub type Result<T, E = BridgeError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_timeout_names_method() {
        let err = BridgeError::RequestTimeout {
            method: "echo".to_string(),
            timeout: Duration::from_millis(50),
        };
        assert!(err.to_string().contains("echo"));
        assert!(err.is_timeout());
        assert!(!err.is_disconnect());
    }

    #[test]
    fn remote_error_carries_message() {
        let err: BridgeError = RemoteError {
            code: None,
            message: "window not found".to_string(),
            data: None,
        }
        .into();
        assert_eq!(err.to_string(), "remote error: window not found");
    }

    #[test]
    fn not_connected_names_state() {
        let err = BridgeError::NotConnected(ConnectionState::Connecting);
        assert_eq!(err.to_string(), "bridge not connected (state: connecting)");
    }
}
