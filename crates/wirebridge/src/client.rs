//! RPC client - the public face of the bridge.
//!
//! Allocates request identifiers, writes requests through the connection and
//! waits on the pending table for the matching response. Responses are
//! correlated by identifier only, so they may arrive in any order.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{broadcast, oneshot, watch};

use crate::bridge::protocol::{Request, RequestId};
use crate::config::BridgeConfig;
use crate::connection::Connection;
use crate::error::{BridgeError, Result};
use crate::notify::{ListenerId, NotificationRouter};
use crate::pending::PendingTable;
use crate::spawner::{ProcessSpawner, WorkerSpawner};
use crate::state::{BridgeEvent, ConnectionState, DisconnectReason};

/// Anything that can issue a JSON-RPC call.
///
/// This abstraction lets typed facades be tested without a worker process.
#[async_trait]
pub trait RpcCaller: Send + Sync {
    async fn call(&self, method: &str, params: Value) -> Result<Value>;
}

/// Request/response bridge to a single worker process.
pub struct Bridge {
    connection: Connection,
    pending: Arc<PendingTable>,
    router: Arc<NotificationRouter>,
    next_id: AtomicU64,
    request_timeout: Duration,
}

impl Bridge {
    pub fn new(config: BridgeConfig) -> Self {
        Self::with_spawner(config, Arc::new(ProcessSpawner))
    }

    pub fn with_spawner(config: BridgeConfig, spawner: Arc<dyn WorkerSpawner>) -> Self {
        let pending = PendingTable::new();
        let router = NotificationRouter::new();
        let request_timeout = config.request_timeout;
        Self {
            connection: Connection::new(
                config,
                spawner,
                Arc::clone(&pending),
                Arc::clone(&router),
            ),
            pending,
            router,
            next_id: AtomicU64::new(1),
            request_timeout,
        }
    }

    /// Spawn the worker and wait until it signals ready.
    pub async fn connect(&self) -> Result<()> {
        self.connection.connect().await
    }

    /// Kill the worker. Every outstanding call fails with `Disconnected`.
    pub async fn disconnect(&self) {
        self.connection.disconnect().await
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_ready()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.connection.watch_state()
    }

    /// Lifecycle and diagnostic events (ready, exit, errors, malformed output).
    pub fn subscribe_events(&self) -> broadcast::Receiver<BridgeEvent> {
        self.connection.subscribe()
    }

    pub fn config(&self) -> &BridgeConfig {
        self.connection.config()
    }

    /// Call `method` and wait for its result.
    ///
    /// Fails immediately with `NotConnected` unless the bridge is ready. The
    /// request timeout covers the whole call, including a stalled stdin.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        if method.is_empty() {
            return Err(BridgeError::InvalidMethod);
        }
        let state = self.state();
        if !state.is_ready() {
            return Err(BridgeError::NotConnected(state));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let line = Request::new(id, method, params)
            .to_line()
            .map_err(|e| BridgeError::InvalidParams(e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        self.pending.register(id, method, tx, self.request_timeout);

        tracing::debug!(id, %method, "Sending request");
        if let Err(e) = self.connection.send_request(id, line).await {
            tracing::warn!(id, %method, error = %e, "Failed to send request");
            // Teardown may already have failed the entry with its own reason.
            self.pending.resolve(id, Err(e));
        }

        match rx.await {
            Ok(outcome) => outcome,
            // The table always completes before dropping; treat as torn down.
            Err(_) => Err(BridgeError::Disconnected(DisconnectReason::Requested)),
        }
    }

    /// Typed wrapper around [`Bridge::call`].
    pub async fn call_as<P, R>(&self, method: &str, params: P) -> Result<R>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let params =
            serde_json::to_value(params).map_err(|e| BridgeError::InvalidParams(e.to_string()))?;
        let result = self.call(method, params).await?;
        serde_json::from_value(result).map_err(|e| BridgeError::Decode(e.to_string()))
    }

    /// Register a listener for notifications named `method`.
    pub fn on_notification<F>(&self, method: impl Into<String>, listener: F) -> ListenerId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.router.on(method, listener)
    }

    /// Register a listener that sees every notification.
    pub fn on_any_notification<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&str, &Value) + Send + Sync + 'static,
    {
        self.router.on_any(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.router.remove(id)
    }

    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, id: RequestId) -> bool {
        self.pending.contains(id)
    }
}

#[async_trait]
impl RpcCaller for Bridge {
    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        Bridge::call(self, method, params).await
    }
}
