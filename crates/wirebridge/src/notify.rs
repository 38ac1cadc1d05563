//! Notification routing from the worker to registered listeners.
//!
//! Listeners are plain callbacks keyed by method name, plus catch-all
//! listeners that see every notification. Dispatch happens on a dedicated
//! task fed by an unbounded channel, so slow listeners never stall stdout
//! decoding.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde_json::Value;
use tokio::sync::mpsc;

use crate::bridge::protocol::Notification;

/// Callback for notifications of one method.
pub type Listener = Arc<dyn Fn(&Value) + Send + Sync>;

/// Callback for every notification: `(method, params)`.
pub type AnyListener = Arc<dyn Fn(&str, &Value) + Send + Sync>;

/// Handle returned on registration, used to remove the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
struct Listeners {
    by_method: HashMap<String, Vec<(ListenerId, Listener)>>,
    any: Vec<(ListenerId, AnyListener)>,
}

#[derive(Default)]
pub struct NotificationRouter {
    listeners: RwLock<Listeners>,
    next_id: AtomicU64,
}

impl NotificationRouter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn allocate_id(&self) -> ListenerId {
        ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Listeners> {
        self.listeners.write().unwrap_or_else(|poisoned| {
            tracing::error!("Listener registry lock poisoned - recovering");
            poisoned.into_inner()
        })
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Listeners> {
        self.listeners.read().unwrap_or_else(|poisoned| {
            tracing::error!("Listener registry lock poisoned - recovering");
            poisoned.into_inner()
        })
    }

    pub fn on<F>(&self, method: impl Into<String>, listener: F) -> ListenerId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let id = self.allocate_id();
        self.write()
            .by_method
            .entry(method.into())
            .or_default()
            .push((id, Arc::new(listener)));
        id
    }

    pub fn on_any<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&str, &Value) + Send + Sync + 'static,
    {
        let id = self.allocate_id();
        self.write().any.push((id, Arc::new(listener)));
        id
    }

    /// Returns false if the listener was not registered.
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut listeners = self.write();
        if let Some(pos) = listeners.any.iter().position(|(lid, _)| *lid == id) {
            listeners.any.remove(pos);
            return true;
        }
        let mut found = false;
        listeners.by_method.retain(|_, entries| {
            if let Some(pos) = entries.iter().position(|(lid, _)| *lid == id) {
                entries.remove(pos);
                found = true;
            }
            !entries.is_empty()
        });
        found
    }

    pub fn listener_count(&self, method: &str) -> usize {
        self.read().by_method.get(method).map_or(0, Vec::len)
    }

    /// Invoke every matching listener. Returns how many were invoked.
    ///
    /// Listeners run outside the registry lock, so they may register or
    /// remove listeners themselves. A panicking listener is logged and skipped.
    pub fn dispatch(&self, notification: &Notification) -> usize {
        let (specific, any): (Vec<Listener>, Vec<AnyListener>) = {
            let listeners = self.read();
            let specific = listeners
                .by_method
                .get(&notification.method)
                .map(|entries| entries.iter().map(|(_, l)| Arc::clone(l)).collect())
                .unwrap_or_default();
            let any = listeners.any.iter().map(|(_, l)| Arc::clone(l)).collect();
            (specific, any)
        };

        if specific.is_empty() && any.is_empty() {
            tracing::trace!(method = %notification.method, "No listeners for notification");
            return 0;
        }

        let method = notification.method.as_str();
        let params = &notification.params;
        let mut invoked = 0;
        for listener in specific {
            if std::panic::catch_unwind(AssertUnwindSafe(|| listener(params))).is_err() {
                tracing::error!(%method, "Notification listener panicked");
            }
            invoked += 1;
        }
        for listener in any {
            if std::panic::catch_unwind(AssertUnwindSafe(|| listener(method, params))).is_err() {
                tracing::error!(%method, "Notification listener panicked");
            }
            invoked += 1;
        }
        invoked
    }

    /// Drain notifications from a session until its sender is dropped.
    pub async fn run(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<Notification>) {
        while let Some(notification) = rx.recv().await {
            let invoked = self.dispatch(&notification);
            tracing::debug!(method = %notification.method, invoked, "Dispatched notification");
        }
        tracing::debug!("Notification dispatcher exiting");
    }
}
