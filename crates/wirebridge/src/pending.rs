//! Pending-request table - correlates responses with waiting callers.
//!
//! Each entry owns the caller's completion channel until exactly one of
//! three things removes it: a matching response, its timeout timer, or
//! `expire_all` on disconnect. Removal goes through `DashMap::remove`, so
//! the response path and the timer path race on a single atomic
//! remove-if-present and the loser sees nothing.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;

use crate::bridge::protocol::RequestId;
use crate::error::BridgeError;

/// Sender half handed to the table at registration.
pub type Completion = oneshot::Sender<Result<Value, BridgeError>>;

struct PendingEntry {
    method: String,
    issued_at: Instant,
    completion: Completion,
    timer: Option<AbortHandle>,
}

impl PendingEntry {
    fn complete(self, id: RequestId, outcome: Result<Value, BridgeError>) {
        if let Some(timer) = self.timer {
            timer.abort();
        }
        tracing::trace!(
            id,
            method = %self.method,
            elapsed_ms = self.issued_at.elapsed().as_millis() as u64,
            ok = outcome.is_ok(),
            "Completing request"
        );
        // Receiver gone means the caller stopped waiting; nothing to do.
        let _ = self.completion.send(outcome);
    }
}

/// Outstanding requests keyed by identifier.
#[derive(Default)]
pub struct PendingTable {
    entries: DashMap<RequestId, PendingEntry>,
}

impl PendingTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Insert a request and arm its timeout.
    ///
    /// Must be called from within a tokio runtime.
    pub fn register(
        self: &Arc<Self>,
        id: RequestId,
        method: impl Into<String>,
        completion: Completion,
        timeout: Duration,
    ) {
        let method = method.into();
        self.entries.insert(
            id,
            PendingEntry {
                method: method.clone(),
                issued_at: Instant::now(),
                completion,
                timer: None,
            },
        );

        let table: Weak<Self> = Arc::downgrade(self);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(table) = table.upgrade() {
                table.expire(id, timeout);
            }
        });

        // The entry may already be gone if a response raced ahead.
        match self.entries.get_mut(&id) {
            Some(mut entry) => entry.timer = Some(timer.abort_handle()),
            None => timer.abort(),
        }
        tracing::debug!(id, %method, timeout_ms = timeout.as_millis() as u64, "Registered request");
    }

    /// Complete a request. Returns false if the identifier was unknown,
    /// which means a late or duplicate response.
    pub fn resolve(&self, id: RequestId, outcome: Result<Value, BridgeError>) -> bool {
        match self.entries.remove(&id) {
            Some((_, entry)) => {
                entry.complete(id, outcome);
                true
            }
            None => {
                tracing::debug!(id, "Discarding response for unknown or expired request");
                false
            }
        }
    }

    /// Remove and fail every remaining entry. Returns how many were failed.
    pub fn expire_all(&self, reason: impl Fn() -> BridgeError) -> usize {
        let ids: Vec<RequestId> = self.entries.iter().map(|e| *e.key()).collect();
        let mut failed = 0;
        for id in ids {
            if let Some((_, entry)) = self.entries.remove(&id) {
                tracing::debug!(id, method = %entry.method, "Failing pending request");
                entry.complete(id, Err(reason()));
                failed += 1;
            }
        }
        failed
    }

    fn expire(&self, id: RequestId, timeout: Duration) {
        if let Some((_, mut entry)) = self.entries.remove(&id) {
            tracing::warn!(id, method = %entry.method, "Request timed out");
            // This task is the timer; don't abort ourselves.
            entry.timer = None;
            let method = entry.method.clone();
            entry.complete(id, Err(BridgeError::RequestTimeout { method, timeout }));
        }
    }

    pub fn contains(&self, id: RequestId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
