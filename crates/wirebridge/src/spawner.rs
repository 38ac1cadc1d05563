//! Worker process spawning.
//!
//! The connection only sees boxed pipes and a [`WorkerProcess`] handle, so
//! tests can swap in an in-memory worker without a real subprocess.

use std::io;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};

use crate::config::BridgeConfig;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] io::Error),
    #[error("{0} not captured")]
    MissingPipe(&'static str),
}

/// Control over a running worker.
#[async_trait]
pub trait WorkerProcess: Send {
    /// OS process id, if there is one.
    fn id(&self) -> Option<u32>;

    /// Wait for exit. Returns the exit code, or `None` if killed by a signal.
    /// Must be cancel safe.
    async fn wait(&mut self) -> io::Result<Option<i32>>;

    /// Forcefully terminate and reap the worker.
    async fn kill(&mut self) -> io::Result<()>;
}

/// A freshly spawned worker with its stdio pipes.
pub struct SpawnedWorker {
    pub stdin: BoxedWriter,
    pub stdout: BoxedReader,
    pub stderr: Option<BoxedReader>,
    pub process: Box<dyn WorkerProcess>,
}

/// Extension point for different worker spawn strategies.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, config: &BridgeConfig) -> Result<SpawnedWorker, SpawnError>;
}

/// Spawns the worker as a child process with all three streams piped.
pub struct ProcessSpawner;

impl WorkerSpawner for ProcessSpawner {
    fn spawn(&self, config: &BridgeConfig) -> Result<SpawnedWorker, SpawnError> {
        let mut command = Command::new(&config.program);
        command
            .args(config.command_args())
            .envs(config.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref dir) = config.current_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn()?;
        tracing::info!(pid = ?child.id(), program = ?config.program, "Spawned worker process");

        let stdin = child.stdin.take().ok_or(SpawnError::MissingPipe("stdin"))?;
        let stdout = child.stdout.take().ok_or(SpawnError::MissingPipe("stdout"))?;
        let stderr = child.stderr.take().map(|s| Box::new(s) as BoxedReader);

        Ok(SpawnedWorker {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr,
            process: Box::new(child),
        })
    }
}

#[async_trait]
impl WorkerProcess for Child {
    fn id(&self) -> Option<u32> {
        Child::id(self)
    }

    async fn wait(&mut self) -> io::Result<Option<i32>> {
        let status = Child::wait(self).await?;
        Ok(status.code())
    }

    async fn kill(&mut self) -> io::Result<()> {
        Child::kill(self).await
    }
}
