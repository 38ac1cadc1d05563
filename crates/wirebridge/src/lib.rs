//! wirebridge: drive a long-lived worker process over stdio with
//! newline-delimited JSON-RPC.
//!
//! The host spawns the worker, waits for its `{"status":"ready"}` signal and
//! then issues calls that are matched to responses by identifier.
//! Notifications from the worker are routed to listeners by method name.

pub mod bridge;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod facade;
pub mod logging;
pub mod notify;
pub mod pending;
pub mod spawner;
pub mod state;

pub use bridge::protocol::{Notification, RemoteError, RequestId};
pub use client::{Bridge, RpcCaller};
pub use config::BridgeConfig;
pub use connection::Connection;
pub use error::{BridgeError, Result};
pub use facade::{AppInfo, ArrangeOptions, Layout, WindowManager};
pub use notify::{ListenerId, NotificationRouter};
pub use pending::PendingTable;
pub use spawner::{
    BoxedReader, BoxedWriter, ProcessSpawner, SpawnError, SpawnedWorker, WorkerProcess,
    WorkerSpawner,
};
pub use state::{BridgeEvent, ConnectionState, DisconnectReason};
