//! Connection lifecycle states and bridge events.

use serde::{Deserialize, Serialize};

/// Lifecycle state of the bridge's connection to its worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    /// No worker process
    #[default]
    Disconnected,
    /// Worker spawned, waiting for its ready signal
    Connecting,
    /// Accepting calls
    Ready,
    /// Tearing down the worker
    Disconnecting,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Ready => "ready",
            Self::Disconnecting => "disconnecting",
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }

    /// True while a worker process may be attached.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Connecting | Self::Ready)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// `disconnect()` was called, or a connect attempt was abandoned.
    Requested,
    /// The worker process exited or closed its output stream.
    WorkerExited { code: Option<i32> },
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Requested => f.write_str("disconnect requested"),
            Self::WorkerExited { code: Some(code) } => {
                write!(f, "worker exited with code {}", code)
            }
            Self::WorkerExited { code: None } => f.write_str("worker exited"),
        }
    }
}

/// Observable lifecycle and diagnostic events.
///
/// Published on a broadcast channel; see `Bridge::subscribe_events`.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeEvent {
    /// Worker signalled ready; the connection is usable.
    Ready,
    /// Worker went away without being asked to.
    Exited { code: Option<i32> },
    /// Process-level failure (spawn, wait, kill).
    Error(String),
    /// A stdout line that could not be parsed or classified.
    MalformedMessage { line: String, reason: String },
}
