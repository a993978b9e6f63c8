//! Worker supervisor - owns the worker subprocess for the life of the host.
//!
//! Flow:
//! 1. Spawn the worker once, stdin/stdout piped, stderr inherited
//! 2. Hand the framed stdout to exactly one consumer
//! 3. Serialize request lines onto stdin, one writer at a time
//! 4. Watch for process exit and publish the status
//! 5. Kill the worker on request once its output can no longer be trusted
//!
//! There is no restart: the worker is required for every invocation, so
//! losing it is fatal to the host (see [`enforce_fatal_policy`]).

use std::fmt;
use std::process::{ExitStatus, Stdio};
use std::sync::Mutex as StdMutex;

use futures::SinkExt;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::watch;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::bridge::codec::{FramingError, JsonLinesCodec, LineFramer};
use crate::bridge::protocol::RequestEnvelope;
use crate::config::{BridgeConfig, FatalPolicy, WorkerCommand};

/// Framed lines from the worker's stdout.
pub type WorkerOutput = FramedRead<ChildStdout, LineFramer>;

type WorkerInput = FramedWrite<ChildStdin, JsonLinesCodec<RequestEnvelope>>;

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn worker '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("worker {0} was not captured as a pipe")]
    MissingPipe(&'static str),
}

/// Extension point for different worker spawn strategies.
///
/// Implementations must pipe stdin and stdout; stderr should be inherited so
/// the worker's diagnostics reach the operator unmodified.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, command: &WorkerCommand) -> Result<Child, SpawnError>;
}

/// Spawns the configured program directly.
pub struct CommandSpawner;

impl WorkerSpawner for CommandSpawner {
    fn spawn(&self, command: &WorkerCommand) -> Result<Child, SpawnError> {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .envs(command.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(dir) = &command.current_dir {
            cmd.current_dir(dir);
        }

        cmd.spawn().map_err(|source| SpawnError::Spawn {
            program: command.program.display().to_string(),
            source,
        })
    }
}

/// How the worker process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl WorkerExit {
    pub fn unknown() -> Self {
        Self {
            code: None,
            signal: None,
        }
    }
}

impl From<ExitStatus> for WorkerExit {
    fn from(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

impl fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => write!(f, "signal {}", signal_name(signal)),
            (None, None) => write!(f, "unknown status"),
        }
    }
}

#[cfg(unix)]
fn signal_name(signal: i32) -> String {
    match nix::sys::signal::Signal::try_from(signal) {
        Ok(sig) => format!("{signal} ({})", sig.as_str()),
        Err(_) => signal.to_string(),
    }
}

#[cfg(not(unix))]
fn signal_name(signal: i32) -> String {
    signal.to_string()
}

/// Why the worker channel became unusable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FatalReason {
    /// Worker never started.
    SpawnFailed(String),
    /// Worker process ended.
    Exited(WorkerExit),
    /// Worker output could not be framed (oversized or truncated line, pipe error).
    Framing(String),
}

impl fmt::Display for FatalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SpawnFailed(e) => write!(f, "worker failed to start: {e}"),
            Self::Exited(exit) => write!(f, "worker exited ({exit})"),
            Self::Framing(e) => write!(f, "worker sent unframeable output: {e}"),
        }
    }
}

/// Log the reason and apply the policy. Returns only under [`FatalPolicy::Continue`].
pub fn enforce_fatal_policy(policy: FatalPolicy, reason: &FatalReason) {
    match policy {
        FatalPolicy::Exit(code) => {
            tracing::error!(%reason, code, "Worker unusable, terminating host process");
            std::process::exit(code);
        }
        FatalPolicy::Continue => {
            tracing::error!(%reason, "Worker unusable, bridge is now defunct");
        }
    }
}

/// Owns the worker process, its stdin writer and its framed stdout.
pub struct WorkerSupervisor {
    pid: Option<u32>,
    writer: tokio::sync::Mutex<WorkerInput>,
    output: StdMutex<Option<WorkerOutput>>,
    exit_rx: watch::Receiver<Option<WorkerExit>>,
    kill_token: CancellationToken,
}

impl WorkerSupervisor {
    /// Spawn the worker. Must be called from within a tokio runtime.
    pub fn start(config: &BridgeConfig) -> Result<Self, SpawnError> {
        tracing::info!(
            program = %config.worker.program.display(),
            args = ?config.worker.args,
            "Spawning worker subprocess"
        );

        let mut child = config.spawner.spawn(&config.worker)?;
        let stdin = child.stdin.take().ok_or(SpawnError::MissingPipe("stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or(SpawnError::MissingPipe("stdout"))?;
        let pid = child.id();

        let (exit_tx, exit_rx) = watch::channel(None);
        let kill_token = CancellationToken::new();
        tokio::spawn(watch_exit(child, exit_tx, kill_token.clone()));

        tracing::debug!(?pid, "Worker started");

        Ok(Self {
            pid,
            writer: tokio::sync::Mutex::new(FramedWrite::new(stdin, JsonLinesCodec::new())),
            output: StdMutex::new(Some(FramedRead::new(
                stdout,
                LineFramer::with_max_length(config.max_line_bytes),
            ))),
            exit_rx,
            kill_token,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Take the worker's framed output. There is exactly one consumer, so
    /// every call after the first returns `None`.
    pub fn take_output(&self) -> Option<WorkerOutput> {
        match self.output.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }

    /// Write one request line to the worker's stdin and flush it.
    pub async fn send(&self, request: RequestEnvelope) -> Result<(), FramingError> {
        let mut writer = self.writer.lock().await;
        writer.send(request).await
    }

    /// Exit status, if the worker has already ended.
    pub fn exit_status(&self) -> Option<WorkerExit> {
        *self.exit_rx.borrow()
    }

    /// Kill the worker. The exit is still published through
    /// [`WorkerSupervisor::wait_exit`]. No-op once it has ended.
    pub fn kill(&self) {
        self.kill_token.cancel();
    }

    /// Resolve once the worker has ended.
    pub async fn wait_exit(&self) -> WorkerExit {
        let mut rx = self.exit_rx.clone();
        match rx.wait_for(Option::is_some).await {
            Ok(exit) => (*exit).unwrap_or_else(WorkerExit::unknown),
            Err(_) => WorkerExit::unknown(),
        }
    }
}

async fn watch_exit(
    mut child: Child,
    exit_tx: watch::Sender<Option<WorkerExit>>,
    kill_token: CancellationToken,
) {
    let pid = child.id();
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill_token.cancelled() => {
            tracing::warn!(?pid, "Killing worker");
            if let Err(e) = child.start_kill() {
                tracing::error!(?pid, error = %e, "Failed to kill worker");
            }
            child.wait().await
        }
    };
    let exit = match status {
        Ok(status) => WorkerExit::from(status),
        Err(e) => {
            tracing::error!(?pid, error = %e, "Failed to wait for worker");
            WorkerExit::unknown()
        }
    };
    tracing::warn!(?pid, %exit, "Worker process ended");
    exit_tx.send_replace(Some(exit));
}
