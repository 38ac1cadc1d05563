//! In-memory worker for driving a [`Bridge`] without a subprocess.
#![allow(dead_code)]

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{Value, json};
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::codec::FramedRead;

use wirebridge::bridge::codec::LineCodec;
use wirebridge::{
    Bridge, BridgeConfig, BridgeEvent, SpawnError, SpawnedWorker, WorkerProcess, WorkerSpawner,
};

/// Upper bound on how long a test waits for anything.
pub const WAIT: Duration = Duration::from_secs(5);

const PIPE_CAPACITY: usize = 64 * 1024;

type ExitStatus = Arc<watch::Sender<Option<Option<i32>>>>;

/// Test-side handle to a fake worker's pipes and process status.
pub struct FakeWorker {
    requests: FramedRead<DuplexStream, LineCodec>,
    stdout: DuplexStream,
    stderr: DuplexStream,
    exit: ExitStatus,
    killed: Arc<AtomicBool>,
}

impl FakeWorker {
    pub async fn write_line(&mut self, line: &str) {
        self.stdout
            .write_all(format!("{}\n", line).as_bytes())
            .await
            .expect("write worker stdout");
    }

    pub async fn send(&mut self, message: Value) {
        self.write_line(&message.to_string()).await;
    }

    pub async fn ready(&mut self) {
        self.send(json!({"status": "ready"})).await;
    }

    pub async fn respond(&mut self, id: u64, result: Value) {
        self.send(json!({"jsonrpc": "2.0", "id": id, "result": result}))
            .await;
    }

    pub async fn notify(&mut self, method: &str, params: Value) {
        self.send(json!({"jsonrpc": "2.0", "method": method, "params": params}))
            .await;
    }

    pub async fn log(&mut self, line: &str) {
        self.stderr
            .write_all(format!("{}\n", line).as_bytes())
            .await
            .expect("write worker stderr");
    }

    /// Next request the host wrote to stdin, parsed.
    pub async fn next_request(&mut self) -> Value {
        let line = tokio::time::timeout(WAIT, self.requests.next())
            .await
            .expect("request within timeout")
            .expect("worker stdin open")
            .expect("valid request line");
        serde_json::from_str(&line).expect("request is JSON")
    }

    /// Answer every request with its own params until stdin closes.
    pub async fn serve_echo(mut self) {
        while let Some(Ok(line)) = self.requests.next().await {
            let request: Value = serde_json::from_str(&line).expect("request is JSON");
            let id = request["id"].as_u64().expect("numeric id");
            let params = request["params"].clone();
            self.respond(id, params).await;
        }
    }

    /// Simulate the worker process exiting on its own.
    pub fn exit(&self, code: Option<i32>) {
        self.exit.send_replace(Some(code));
    }

    pub fn was_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }
}

struct FakeProcess {
    exit: ExitStatus,
    killed: Arc<AtomicBool>,
}

#[async_trait]
impl WorkerProcess for FakeProcess {
    fn id(&self) -> Option<u32> {
        None
    }

    async fn wait(&mut self) -> io::Result<Option<i32>> {
        let mut rx = self.exit.subscribe();
        let status = *rx.wait_for(Option::is_some).await.map_err(io::Error::other)?;
        Ok(status.flatten())
    }

    async fn kill(&mut self) -> io::Result<()> {
        self.killed.store(true, Ordering::SeqCst);
        self.exit.send_if_modified(|status| {
            if status.is_none() {
                *status = Some(None);
                true
            } else {
                false
            }
        });
        Ok(())
    }
}

/// Hands each spawned worker to the test through a channel.
pub struct FakeSpawner {
    workers: mpsc::UnboundedSender<FakeWorker>,
    spawned: AtomicUsize,
}

impl FakeSpawner {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<FakeWorker>) {
        let (workers, rx) = mpsc::unbounded_channel();
        let spawner = Arc::new(Self {
            workers,
            spawned: AtomicUsize::new(0),
        });
        (spawner, rx)
    }

    pub fn spawned(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }
}

impl WorkerSpawner for FakeSpawner {
    fn spawn(&self, _config: &BridgeConfig) -> Result<SpawnedWorker, SpawnError> {
        let (host_stdin, worker_stdin) = tokio::io::duplex(PIPE_CAPACITY);
        let (host_stdout, worker_stdout) = tokio::io::duplex(PIPE_CAPACITY);
        let (host_stderr, worker_stderr) = tokio::io::duplex(PIPE_CAPACITY);
        let (exit, _) = watch::channel(None);
        let exit = Arc::new(exit);
        let killed = Arc::new(AtomicBool::new(false));

        let worker = FakeWorker {
            requests: FramedRead::new(worker_stdin, LineCodec::new()),
            stdout: worker_stdout,
            stderr: worker_stderr,
            exit: Arc::clone(&exit),
            killed: Arc::clone(&killed),
        };
        self.workers
            .send(worker)
            .map_err(|_| SpawnError::MissingPipe("test worker handle"))?;
        self.spawned.fetch_add(1, Ordering::SeqCst);

        Ok(SpawnedWorker {
            stdin: Box::new(host_stdin),
            stdout: Box::new(host_stdout),
            stderr: Some(Box::new(host_stderr)),
            process: Box::new(FakeProcess { exit, killed }),
        })
    }
}

/// A bridge wired to a fake spawner; not yet connected.
pub fn fake_bridge(config: BridgeConfig) -> (Bridge, mpsc::UnboundedReceiver<FakeWorker>) {
    let (spawner, workers) = FakeSpawner::new();
    (Bridge::with_spawner(config, spawner), workers)
}

/// Connect `bridge`, playing the worker side of the handshake.
pub async fn connect(bridge: &Bridge, workers: &mut mpsc::UnboundedReceiver<FakeWorker>) -> FakeWorker {
    let (result, worker) = tokio::join!(bridge.connect(), async {
        let mut worker = tokio::time::timeout(WAIT, workers.recv())
            .await
            .expect("spawn within timeout")
            .expect("spawner alive");
        worker.ready().await;
        worker
    });
    result.expect("connect");
    worker
}

/// A connected bridge and its worker.
pub async fn connected(config: BridgeConfig) -> (Bridge, FakeWorker) {
    let (bridge, mut workers) = fake_bridge(config);
    let worker = connect(&bridge, &mut workers).await;
    (bridge, worker)
}

/// Wait for the first event matching `pred`.
pub async fn wait_for_event(
    events: &mut broadcast::Receiver<BridgeEvent>,
    pred: impl Fn(&BridgeEvent) -> bool,
) -> BridgeEvent {
    tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("event within timeout")
}
