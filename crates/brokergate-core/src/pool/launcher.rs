// Worker launchers
//
// Decision: Process isolation is the default; in-process workers exist for tests and
//           single-binary deployments and speak the exact same framed protocol
// Decision: The launcher only opens the pipe; the handshake lives in startup.rs

use brokergate_protocol::AccountHandle;
use brokergate_worker::{serve, RegistryFactory, SessionEnd, StandardHandlers};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{PoolError, PoolResult};

/// Environment variable pointing at the worker executable
pub const WORKER_BIN_ENV: &str = "BROKERGATE_WORKER_BIN";

const WORKER_BIN_NAME: &str = "brokergate-worker";

pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Host side of a freshly launched worker
pub struct WorkerChannel {
    pub reader: BoxReader,
    pub writer: BoxWriter,
    pub child: WorkerChild,
}

/// The execution unit behind a worker
#[derive(Debug)]
pub enum WorkerChild {
    Process(Child),
    Task(JoinHandle<()>),
}

impl WorkerChild {
    /// OS pid for process workers
    pub fn os_pid(&self) -> Option<u32> {
        match self {
            WorkerChild::Process(child) => child.id(),
            WorkerChild::Task(_) => None,
        }
    }

    /// Liveness probe that never blocks
    pub fn is_alive(&mut self) -> bool {
        match self {
            WorkerChild::Process(child) => matches!(child.try_wait(), Ok(None)),
            WorkerChild::Task(handle) => !handle.is_finished(),
        }
    }

    /// Wait up to `grace` for a voluntary exit, then kill
    pub async fn reap(&mut self, grace: Duration) {
        match self {
            WorkerChild::Process(child) => {
                match tokio::time::timeout(grace, child.wait()).await {
                    Ok(Ok(status)) => debug!(%status, "Worker process exited"),
                    Ok(Err(e)) => warn!(error = %e, "Failed waiting for worker process"),
                    Err(_) => {
                        warn!(pid = ?child.id(), "Worker ignored shutdown, killing");
                        if let Err(e) = child.kill().await {
                            warn!(error = %e, "Failed to kill worker process");
                        }
                    }
                }
            }
            WorkerChild::Task(handle) => {
                if handle.is_finished() {
                    return;
                }
                if tokio::time::timeout(grace, &mut *handle).await.is_err() {
                    warn!("In-process worker ignored shutdown, aborting");
                    handle.abort();
                }
            }
        }
    }
}

/// Opens a pipe to a new worker for an account
pub trait WorkerLauncher: Send + Sync {
    fn launch(&self, account: &AccountHandle) -> PoolResult<WorkerChannel>;

    /// Short name for logs
    fn kind(&self) -> &'static str;
}

// =============================================================================
// OS process launcher
// =============================================================================

/// Spawns the worker executable with frames on stdin/stdout
///
/// The child's stderr is inherited so worker logs land next to the host's.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<String>,
    envs: Vec<(String, String)>,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    /// `BROKERGATE_WORKER_BIN`, else `brokergate-worker` next to the current executable
    pub fn from_env() -> Self {
        if let Ok(path) = std::env::var(WORKER_BIN_ENV) {
            return Self::new(path);
        }
        let sibling = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join(WORKER_BIN_NAME)))
            .filter(|path| path.exists());
        Self::new(sibling.unwrap_or_else(|| PathBuf::from(WORKER_BIN_NAME)))
    }

    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn program(&self) -> &std::path::Path {
        &self.program
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn launch(&self, account: &AccountHandle) -> PoolResult<WorkerChannel> {
        let startup_failed = |reason: String| PoolError::StartupFailed {
            account_id: account.id,
            reason,
        };

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| startup_failed(format!("spawn {}: {}", self.program.display(), e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| startup_failed("worker stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| startup_failed("worker stdout not captured".to_string()))?;

        info!(
            account_id = %account.id,
            pid = ?child.id(),
            program = %self.program.display(),
            "Spawned worker process"
        );

        Ok(WorkerChannel {
            reader: Box::new(stdout),
            writer: Box::new(stdin),
            child: WorkerChild::Process(child),
        })
    }

    fn kind(&self) -> &'static str {
        "process"
    }
}

// =============================================================================
// In-process launcher
// =============================================================================

/// Runs the worker session on a tokio task over an in-memory pipe
#[derive(Clone)]
pub struct InProcessLauncher {
    factory: Arc<dyn RegistryFactory>,
    buffer: usize,
}

impl Default for InProcessLauncher {
    fn default() -> Self {
        Self::new(Arc::new(StandardHandlers::new()))
    }
}

impl InProcessLauncher {
    pub fn new(factory: Arc<dyn RegistryFactory>) -> Self {
        Self {
            factory,
            buffer: 256 * 1024,
        }
    }

    pub fn with_buffer(mut self, bytes: usize) -> Self {
        self.buffer = bytes.max(1024);
        self
    }
}

impl WorkerLauncher for InProcessLauncher {
    fn launch(&self, account: &AccountHandle) -> PoolResult<WorkerChannel> {
        let (host, worker) = tokio::io::duplex(self.buffer);
        let (worker_read, worker_write) = tokio::io::split(worker);
        let (host_read, host_write) = tokio::io::split(host);

        let factory = Arc::clone(&self.factory);
        let account_id = account.id;
        let handle = tokio::spawn(async move {
            match serve(worker_read, worker_write, factory).await {
                Ok(SessionEnd::Fatal(reason)) => {
                    warn!(%account_id, reason = %reason, "In-process worker terminated")
                }
                Ok(end) => debug!(%account_id, ?end, "In-process worker finished"),
                Err(e) => warn!(%account_id, error = %e, "In-process worker failed"),
            }
        });

        Ok(WorkerChannel {
            reader: Box::new(host_read),
            writer: Box::new(host_write),
            child: WorkerChild::Task(handle),
        })
    }

    fn kind(&self) -> &'static str {
        "in_process"
    }
}
