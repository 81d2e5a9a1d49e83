//! Starting and supervising worker processes.
//!
//! An agent does not care how a worker runs; it asks a [`WorkerLauncher`] for
//! one and receives a [`Dialer`] to reach it plus a [`WorkerProcess`] handle
//! to watch it. [`ProcessWorkerLauncher`] starts real OS processes.

use async_trait::async_trait;
use gridbench_env::{Dialer, SimulatorAddress, TcpDialer};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Line a worker prints on stdout once it listens.
pub const LISTENING_PREFIX: &str = "GRIDBENCH_WORKER_LISTENING ";

/// Role of a worker in the benchmarked cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkerType {
    /// Holds data (cluster member)
    Member,
    /// Only talks to members
    Client,
}

impl WorkerType {
    pub fn is_member(self) -> bool {
        self == WorkerType::Member
    }
}

impl fmt::Display for WorkerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerType::Member => write!(f, "member"),
            WorkerType::Client => write!(f, "client"),
        }
    }
}

impl std::str::FromStr for WorkerType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "member" => Ok(WorkerType::Member),
            "client" => Ok(WorkerType::Client),
            other => Err(format!("Unknown worker type: {}", other)),
        }
    }
}

/// Everything an agent needs to start one worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerProcessSettings {
    /// Index assigned by the coordinator's registry
    pub worker_index: u32,

    pub worker_type: WorkerType,

    /// Extra environment variables for the worker
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

impl WorkerProcessSettings {
    pub fn new(worker_index: u32, worker_type: WorkerType) -> Self {
        Self {
            worker_index,
            worker_type,
            environment: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("Could not spawn worker {address}: {reason}")]
    Spawn {
        address: SimulatorAddress,
        reason: String,
    },

    #[error("Worker {address} did not report its endpoint within {timeout_ms}ms")]
    StartupTimeout {
        address: SimulatorAddress,
        timeout_ms: u64,
    },

    #[error("Worker {address} exited during startup")]
    ExitedDuringStartup { address: SimulatorAddress },
}

/// How a worker process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerExit {
    /// Exit code, `None` if killed by a signal or unknown
    pub code: Option<i32>,
}

impl WorkerExit {
    pub fn is_normal(&self) -> bool {
        self.code == Some(0)
    }
}

/// Handle on a running worker.
pub trait WorkerProcess: Send + 'static {
    /// Identifier for logs (pid, sim id, ...).
    fn id(&self) -> String;

    /// Returns the exit status if the worker has exited, without waiting.
    fn try_exit(&mut self) -> Option<WorkerExit>;

    /// Terminates the worker immediately.
    fn kill(&mut self);
}

/// A started worker.
pub struct LaunchedWorker {
    /// Reaches the worker's listener
    pub dialer: Arc<dyn Dialer>,

    pub process: Box<dyn WorkerProcess>,
}

/// Starts workers for an agent.
#[async_trait]
pub trait WorkerLauncher: Send + Sync + 'static {
    async fn launch(
        &self,
        address: SimulatorAddress,
        settings: &WorkerProcessSettings,
    ) -> Result<LaunchedWorker, LaunchError>;
}

// =============================================================================
// OS PROCESSES
// =============================================================================

/// Starts each worker as a child process of the agent.
///
/// The child runs `<program> <args..> worker --address <A_W> --type <t>
/// --listen 127.0.0.1:0` and prints [`LISTENING_PREFIX`] followed by its
/// port on stdout once ready.
pub struct ProcessWorkerLauncher {
    program: PathBuf,
    args: Vec<String>,
    startup_timeout: Duration,
}

impl ProcessWorkerLauncher {
    pub fn new(program: PathBuf, startup_timeout: Duration) -> Self {
        Self {
            program,
            args: Vec::new(),
            startup_timeout,
        }
    }

    /// Launches workers by re-executing the current binary.
    pub fn current_exe(startup_timeout: Duration) -> std::io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?, startup_timeout))
    }

    /// Arguments placed before the `worker` subcommand.
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    async fn read_port(
        address: SimulatorAddress,
        child: &mut Child,
    ) -> Result<u16, LaunchError> {
        let stdout = child.stdout.take().ok_or_else(|| LaunchError::Spawn {
            address,
            reason: "stdout is not captured".to_string(),
        })?;
        let mut lines = BufReader::new(stdout).lines();

        loop {
            let line = lines.next_line().await.map_err(|e| LaunchError::Spawn {
                address,
                reason: e.to_string(),
            })?;
            let Some(line) = line else {
                return Err(LaunchError::ExitedDuringStartup { address });
            };
            if let Some(port) = line.strip_prefix(LISTENING_PREFIX) {
                let port = port.trim().parse::<u16>().map_err(|e| LaunchError::Spawn {
                    address,
                    reason: format!("bad port in '{}': {}", line, e),
                })?;
                // Keep draining so the child never blocks on a full pipe.
                tokio::spawn(async move {
                    while let Ok(Some(line)) = lines.next_line().await {
                        debug!(worker = %address, "{}", line);
                    }
                });
                return Ok(port);
            }
            debug!(worker = %address, "{}", line);
        }
    }
}

#[async_trait]
impl WorkerLauncher for ProcessWorkerLauncher {
    async fn launch(
        &self,
        address: SimulatorAddress,
        settings: &WorkerProcessSettings,
    ) -> Result<LaunchedWorker, LaunchError> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .arg("worker")
            .arg("--address")
            .arg(address.to_string())
            .arg("--type")
            .arg(settings.worker_type.to_string())
            .arg("--listen")
            .arg("127.0.0.1:0")
            .envs(&settings.environment)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| LaunchError::Spawn {
            address,
            reason: e.to_string(),
        })?;
        let pid = child.id().unwrap_or(0);

        let port = match tokio::time::timeout(self.startup_timeout, Self::read_port(address, &mut child)).await {
            Ok(Ok(port)) => port,
            Ok(Err(e)) => {
                let _ = child.start_kill();
                return Err(e);
            }
            Err(_) => {
                let _ = child.start_kill();
                return Err(LaunchError::StartupTimeout {
                    address,
                    timeout_ms: self.startup_timeout.as_millis() as u64,
                });
            }
        };

        info!(worker = %address, pid, port, "Worker process started");
        Ok(LaunchedWorker {
            dialer: Arc::new(TcpDialer::new(format!("127.0.0.1:{}", port))),
            process: Box::new(ChildProcess { child, pid }),
        })
    }
}

struct ChildProcess {
    child: Child,
    pid: u32,
}

impl WorkerProcess for ChildProcess {
    fn id(&self) -> String {
        self.pid.to_string()
    }

    fn try_exit(&mut self) -> Option<WorkerExit> {
        match self.child.try_wait() {
            Ok(Some(status)) => Some(WorkerExit {
                code: status.code(),
            }),
            Ok(None) => None,
            Err(e) => {
                warn!(pid = self.pid, error = %e, "Could not poll worker process");
                None
            }
        }
    }

    fn kill(&mut self) {
        if let Err(e) = self.child.start_kill() {
            warn!(pid = self.pid, error = %e, "Could not kill worker process");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_type_parse() {
        assert_eq!("Member".parse::<WorkerType>(), Ok(WorkerType::Member));
        assert_eq!("client".parse::<WorkerType>(), Ok(WorkerType::Client));
        assert!("lite".parse::<WorkerType>().is_err());
    }

    #[test]
    fn test_exit_normal() {
        assert!(WorkerExit { code: Some(0) }.is_normal());
        assert!(!WorkerExit { code: Some(1) }.is_normal());
        assert!(!WorkerExit { code: None }.is_normal());
    }

    #[tokio::test]
    async fn test_missing_program_fails_to_spawn() {
        let launcher = ProcessWorkerLauncher::new(
            PathBuf::from("/nonexistent/gridbench-worker"),
            Duration::from_secs(1),
        );
        let result = launcher
            .launch(
                SimulatorAddress::worker(1, 1),
                &WorkerProcessSettings::new(1, WorkerType::Member),
            )
            .await;
        assert!(matches!(result, Err(LaunchError::Spawn { .. })));
    }
}
