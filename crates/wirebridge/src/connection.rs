//! Connection state machine - owns the worker process and its session task.
//!
//! Flow:
//! 1. `connect()` moves Disconnected → Connecting and spawns the worker
//! 2. A session task reads stdout through LineCodec and classifies each line
//! 3. The ready signal moves Connecting → Ready and resolves `connect()`
//! 4. Responses go to the pending table, notifications to the dispatcher
//! 5. On worker exit or `disconnect()`: kill, fail all pending, → Disconnected
//!
//! Only the session task reads stdout and changes state on its own; callers
//! change state only through `connect()`/`disconnect()`, which serialize on
//! the session lock. Requests are queued to a per-session writer task, so a
//! worker that stops reading stdin never holds up a caller or a lock.

use std::io;
use std::sync::{Arc, PoisonError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::{Mutex, broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::bridge::codec::LineCodec;
use crate::bridge::protocol::{self, InboundMessage, Notification, RequestId, Response};
use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::notify::NotificationRouter;
use crate::pending::PendingTable;
use crate::spawner::{BoxedReader, BoxedWriter, WorkerProcess, WorkerSpawner};
use crate::state::{BridgeEvent, ConnectionState, DisconnectReason};

type LineReader = FramedRead<BoxedReader, LineCodec>;
type LineWriter = FramedWrite<BoxedWriter, LineCodec>;

/// How long to keep reading stdout after the worker has exited.
const EXIT_DRAIN_TIMEOUT: Duration = Duration::from_millis(100);

/// How long a worker that closed stdout gets to exit before it is killed.
const EXIT_GRACE_PERIOD: Duration = Duration::from_secs(2);

const EVENT_CAPACITY: usize = 64;

/// Longest slice of a malformed line that goes into the log.
const LOG_LINE_LIMIT: usize = 200;

/// An encoded request waiting for the writer task.
struct Outgoing {
    id: RequestId,
    line: String,
}

type OutgoingTx = mpsc::UnboundedSender<Outgoing>;

/// State shared between the connection handle and its session task.
struct Shared {
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<BridgeEvent>,
    pending: Arc<PendingTable>,
    router: Arc<NotificationRouter>,
    /// Why the most recent session ended.
    last_end: std::sync::Mutex<Option<DisconnectReason>>,
}

impl Shared {
    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn set_state(&self, next: ConnectionState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            tracing::debug!(from = %prev, to = %next, "Connection state changed");
        }
    }

    /// Compare-and-set. Returns false if the current state is not `from`.
    fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        let changed = self.state.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        });
        if changed {
            tracing::debug!(from = %from, to = %to, "Connection state changed");
        }
        changed
    }

    fn emit(&self, event: BridgeEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn record_end(&self, reason: DisconnectReason) {
        *self.last_end.lock().unwrap_or_else(PoisonError::into_inner) = Some(reason);
    }

    fn last_end(&self) -> DisconnectReason {
        let last = *self.last_end.lock().unwrap_or_else(PoisonError::into_inner);
        last.unwrap_or(DisconnectReason::Requested)
    }
}

struct Session {
    generation: u64,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Lifecycle owner for one worker at a time.
pub struct Connection {
    config: BridgeConfig,
    spawner: Arc<dyn WorkerSpawner>,
    shared: Arc<Shared>,
    outgoing: Arc<Mutex<Option<OutgoingTx>>>,
    session: Mutex<Option<Session>>,
    generation: AtomicU64,
}

impl Connection {
    pub fn new(
        config: BridgeConfig,
        spawner: Arc<dyn WorkerSpawner>,
        pending: Arc<PendingTable>,
        router: Arc<NotificationRouter>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            config,
            spawner,
            shared: Arc::new(Shared {
                state,
                events,
                pending,
                router,
                last_end: std::sync::Mutex::new(None),
            }),
            outgoing: Arc::new(Mutex::new(None)),
            session: Mutex::new(None),
            generation: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.shared.events.subscribe()
    }

    /// Spawn the worker and wait for its ready signal.
    ///
    /// Only valid from Disconnected. Fails with `ConnectTimeout` (worker
    /// killed) if no ready signal arrives within the connect timeout.
    pub async fn connect(&self) -> Result<()> {
        let (generation, ready_rx) = {
            let mut session = self.session.lock().await;
            if !self
                .shared
                .transition(ConnectionState::Disconnected, ConnectionState::Connecting)
            {
                return Err(BridgeError::InvalidState(self.state()));
            }

            let worker = match self.spawner.spawn(&self.config) {
                Ok(worker) => worker,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to spawn worker");
                    self.shared.set_state(ConnectionState::Disconnected);
                    self.shared.emit(BridgeEvent::Error(e.to_string()));
                    return Err(BridgeError::Spawn(e.to_string()));
                }
            };

            let cancel = CancellationToken::new();
            let writer_stop = CancellationToken::new();
            let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
            tokio::spawn(write_requests(
                FramedWrite::new(worker.stdin, LineCodec::new()),
                outgoing_rx,
                Arc::clone(&self.shared),
                writer_stop.clone(),
            ));
            *self.outgoing.lock().await = Some(outgoing_tx);

            let reader = FramedRead::new(
                worker.stdout,
                LineCodec::with_max_length(self.config.max_line_length),
            );
            if let Some(stderr) = worker.stderr {
                tokio::spawn(forward_stderr(stderr));
            }

            let (notify_tx, notify_rx) = mpsc::unbounded_channel();
            tokio::spawn(Arc::clone(&self.shared.router).run(notify_rx));

            let (ready_tx, ready_rx) = oneshot::channel();
            let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            let inbound = InboundHandler {
                shared: Arc::clone(&self.shared),
                ready_tx: Some(ready_tx),
                notify_tx,
            };
            let task = tokio::spawn(run_session(
                reader,
                worker.process,
                inbound,
                Arc::clone(&self.outgoing),
                cancel.clone(),
                writer_stop,
            ));

            // Any previous session has already torn itself down.
            *session = Some(Session {
                generation,
                cancel,
                task,
            });
            (generation, ready_rx)
        };

        tracing::debug!(
            timeout_ms = self.config.connect_timeout.as_millis() as u64,
            "Waiting for ready signal from worker"
        );
        match tokio::time::timeout(self.config.connect_timeout, ready_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BridgeError::Disconnected(DisconnectReason::Requested)),
            Err(_) => {
                tracing::warn!(
                    timeout_ms = self.config.connect_timeout.as_millis() as u64,
                    "Worker did not signal ready in time"
                );
                self.end_session(Some(generation)).await;
                Err(BridgeError::ConnectTimeout(self.config.connect_timeout))
            }
        }
    }

    /// Kill the worker and fail every pending request. No-op when disconnected.
    pub async fn disconnect(&self) {
        self.end_session(None).await;
    }

    /// Tear down the current session, or only the given generation.
    async fn end_session(&self, generation: Option<u64>) {
        let mut session = self.session.lock().await;
        if let (Some(expected), Some(current)) = (generation, session.as_ref())
            && current.generation != expected
        {
            return;
        }

        let began = self.shared.transition(ConnectionState::Ready, ConnectionState::Disconnecting)
            || self
                .shared
                .transition(ConnectionState::Connecting, ConnectionState::Disconnecting);
        let Some(current) = session.take() else {
            tracing::debug!("Disconnect with no active session");
            return;
        };
        if !began {
            // Worker already went away; the session cleaned up after itself.
            tracing::debug!(state = %self.state(), "Disconnect on inactive connection");
            return;
        }

        tracing::info!("Disconnecting worker");
        current.cancel.cancel();
        if let Err(e) = current.task.await {
            tracing::error!(error = %e, "Session task failed");
            self.outgoing.lock().await.take();
            self.shared
                .pending
                .expire_all(|| BridgeError::Disconnected(DisconnectReason::Requested));
            self.shared.record_end(DisconnectReason::Requested);
            self.shared.set_state(ConnectionState::Disconnected);
        }
    }

    /// Queue an encoded request for the worker's stdin. Never waits on the pipe.
    ///
    /// A write that fails later resolves request `id` with `Transport`.
    pub(crate) async fn send_request(&self, id: RequestId, line: String) -> Result<()> {
        let outgoing = self.outgoing.lock().await;
        let Some(tx) = outgoing.as_ref() else {
            // The session ended after the caller saw Ready.
            return Err(BridgeError::Disconnected(self.shared.last_end()));
        };
        tx.send(Outgoing { id, line })
            .map_err(|_| BridgeError::Transport("worker stdin writer has stopped".to_string()))
    }
}

/// Routes classified stdout lines to their consumers.
struct InboundHandler {
    shared: Arc<Shared>,
    ready_tx: Option<oneshot::Sender<Result<()>>>,
    notify_tx: mpsc::UnboundedSender<Notification>,
}

impl InboundHandler {
    fn handle_line(&mut self, line: &str) {
        match protocol::decode_line(line) {
            Ok(InboundMessage::Ready) => {
                if self
                    .shared
                    .transition(ConnectionState::Connecting, ConnectionState::Ready)
                {
                    tracing::info!("Worker ready");
                    if let Some(tx) = self.ready_tx.take() {
                        let _ = tx.send(Ok(()));
                    }
                    self.shared.emit(BridgeEvent::Ready);
                } else {
                    tracing::warn!(state = %self.shared.state(), "Unexpected ready signal");
                }
            }
            Ok(InboundMessage::Response(Response { id, outcome })) => {
                tracing::trace!(id, ok = outcome.is_ok(), "Response received");
                self.shared
                    .pending
                    .resolve(id, outcome.map_err(BridgeError::Remote));
            }
            Ok(InboundMessage::Notification(notification)) => {
                tracing::trace!(method = %notification.method, "Notification received");
                if self.notify_tx.send(notification).is_err() {
                    tracing::debug!("Notification dispatcher gone, dropping notification");
                }
            }
            Err(e) => {
                let shown: String = line.chars().take(LOG_LINE_LIMIT).collect();
                tracing::warn!(error = %e, line = %shown, "Dropping malformed message from worker");
                self.shared.emit(BridgeEvent::MalformedMessage {
                    line: line.to_string(),
                    reason: e.to_string(),
                });
            }
        }
    }

    /// Fail everything still waiting on this session and publish the exit.
    fn finish(mut self, reason: DisconnectReason) {
        let failed = self
            .shared
            .pending
            .expire_all(|| BridgeError::Disconnected(reason));
        if let Some(tx) = self.ready_tx.take() {
            let _ = tx.send(Err(BridgeError::Disconnected(reason)));
        }
        self.shared.record_end(reason);
        self.shared.set_state(ConnectionState::Disconnected);
        if let DisconnectReason::WorkerExited { code } = reason {
            self.shared.emit(BridgeEvent::Exited { code });
        }
        tracing::info!(%reason, failed_requests = failed, "Worker session ended");
    }
}

enum SessionEnd {
    Requested,
    Exited(Option<i32>),
    StreamClosed,
}

fn exit_code(shared: &Shared, status: io::Result<Option<i32>>) -> Option<i32> {
    match status {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "Failed to wait for worker");
            shared.emit(BridgeEvent::Error(format!("failed to wait for worker: {}", e)));
            None
        }
    }
}

async fn run_session(
    mut reader: LineReader,
    mut process: Box<dyn WorkerProcess>,
    mut inbound: InboundHandler,
    outgoing: Arc<Mutex<Option<OutgoingTx>>>,
    cancel: CancellationToken,
    writer_stop: CancellationToken,
) {
    let _writer_stop = writer_stop.drop_guard();
    let pid = process.id();
    tracing::debug!(?pid, "Worker session started");

    let end = loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break SessionEnd::Requested,

            frame = reader.next() => match frame {
                Some(Ok(line)) => inbound.handle_line(&line),
                Some(Err(e)) => {
                    tracing::error!(error = %e, "Error reading worker stdout");
                    break SessionEnd::StreamClosed;
                }
                None => {
                    tracing::info!("Worker stdout closed (EOF)");
                    break SessionEnd::StreamClosed;
                }
            },

            status = process.wait() => {
                break SessionEnd::Exited(exit_code(&inbound.shared, status));
            }
        }
    };

    let reason = match end {
        SessionEnd::Requested => {
            if let Err(e) = process.kill().await {
                tracing::warn!(error = %e, "Failed to kill worker");
                inbound
                    .shared
                    .emit(BridgeEvent::Error(format!("failed to kill worker: {}", e)));
            }
            DisconnectReason::Requested
        }
        SessionEnd::Exited(code) => {
            tracing::warn!(?pid, ?code, "Worker exited");
            // Pick up anything written just before exit.
            let drained = tokio::time::timeout(EXIT_DRAIN_TIMEOUT, async {
                while let Some(Ok(line)) = reader.next().await {
                    inbound.handle_line(&line);
                }
            })
            .await;
            if drained.is_err() {
                tracing::debug!("Stopped draining worker stdout after exit");
            }
            DisconnectReason::WorkerExited { code }
        }
        SessionEnd::StreamClosed => {
            let code = match tokio::time::timeout(EXIT_GRACE_PERIOD, process.wait()).await {
                Ok(status) => exit_code(&inbound.shared, status),
                Err(_) => {
                    tracing::warn!(?pid, "Worker closed stdout but did not exit, killing");
                    if let Err(e) = process.kill().await {
                        tracing::warn!(error = %e, "Failed to kill worker");
                    }
                    None
                }
            };
            DisconnectReason::WorkerExited { code }
        }
    };

    outgoing.lock().await.take();
    inbound.finish(reason);
}

/// Drain queued requests into the worker's stdin until the session ends.
///
/// Dropping the writer on return closes stdin.
async fn write_requests(
    mut writer: LineWriter,
    mut rx: mpsc::UnboundedReceiver<Outgoing>,
    shared: Arc<Shared>,
    stop: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = stop.cancelled() => None,
            next = rx.recv() => next,
        };
        let Some(Outgoing { id, line }) = next else {
            break;
        };

        let written = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            written = writer.send(line) => written,
        };
        if let Err(e) = written {
            tracing::warn!(id, error = %e, "Failed to write request to worker stdin");
            let reason = format!("failed to write to worker stdin: {}", e);
            shared.emit(BridgeEvent::Error(reason.clone()));
            shared.pending.resolve(id, Err(BridgeError::Transport(reason.clone())));
            rx.close();
            while let Some(queued) = rx.recv().await {
                shared
                    .pending
                    .resolve(queued.id, Err(BridgeError::Transport(reason.clone())));
            }
            break;
        }
    }
    tracing::debug!("Worker stdin writer stopped");
}

/// Forward worker stderr lines to tracing. Never parsed as protocol.
async fn forward_stderr(stderr: BoxedReader) {
    let mut lines = FramedRead::new(stderr, LineCodec::new());
    while let Some(line) = lines.next().await {
        match line {
            Ok(line) => tracing::info!(target: "wirebridge::worker", "{}", line),
            Err(e) => {
                tracing::debug!(error = %e, "Error reading worker stderr");
                break;
            }
        }
    }
}
