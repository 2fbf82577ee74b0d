//! Workers running as child processes speaking the protocol over stdio.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use sandbox::{
    ExecutionRequest, ExecutionResult, Result, RuntimeLimits, SandboxError, Worker,
    WorkerLauncher,
};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, warn};

use crate::channel::WorkerChannel;

/// Env var the `worker` subcommand reads its heap limit from.
pub const ENV_MEMORY_LIMIT: &str = "JSBOX_MEMORY_LIMIT_BYTES";
/// Env var the `worker` subcommand reads its stack limit from.
pub const ENV_MAX_STACK: &str = "JSBOX_MAX_STACK_BYTES";

const PING_TIMEOUT: Duration = Duration::from_secs(1);
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// How to start a worker process.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub limits: RuntimeLimits,
    /// Budget for spawn plus handshake.
    pub startup_timeout: Duration,
}

impl WorkerSpec {
    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .env(ENV_MEMORY_LIMIT, self.limits.memory_limit_bytes.to_string())
            .env(ENV_MAX_STACK, self.limits.max_stack_bytes.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            // Own process group so a kill reaches anything the worker spawned.
            .process_group(0)
            .kill_on_drop(true);
        cmd
    }
}

/// Kill the entire process group of `child` via `killpg(SIGKILL)`.
///
/// Requires the child to have been spawned with `process_group(0)` so that its
/// PGID equals its PID. No-op if the child has already been reaped.
fn kill_process_group(child: &Child) {
    if let Some(pid) = child.id()
        && let Ok(pid) = i32::try_from(pid)
    {
        let pgid = nix::unistd::Pid::from_raw(pid);
        let _ = nix::sys::signal::killpg(pgid, nix::sys::signal::Signal::SIGKILL);
    }
}

/// A worker child process.
pub struct ProcessWorker {
    id: String,
    child: Child,
    channel: WorkerChannel<ChildStdout, ChildStdin>,
}

impl ProcessWorker {
    /// Spawn a worker and wait for its handshake.
    pub async fn spawn(spec: &WorkerSpec) -> Result<Self> {
        let mut child = spec.command().spawn().map_err(|e| {
            SandboxError::SpawnFailed(format!("{}: {e}", spec.program.display()))
        })?;
        let id = format!("worker-{}", child.id().unwrap_or_default());

        let pipes = child.stdout.take().zip(child.stdin.take());
        let Some((stdout, stdin)) = pipes else {
            kill_process_group(&child);
            let _ = child.wait().await;
            return Err(SandboxError::SpawnFailed("worker stdio not piped".into()));
        };

        match WorkerChannel::connect(stdout, stdin, spec.startup_timeout).await {
            Ok(channel) => {
                debug!(worker_id = %id, "worker ready");
                Ok(Self { id, child, channel })
            }
            Err(e) => {
                warn!(worker_id = %id, error = %e, "worker handshake failed");
                kill_process_group(&child);
                let _ = child.wait().await;
                Err(e)
            }
        }
    }
}

#[async_trait]
impl Worker for ProcessWorker {
    fn id(&self) -> &str {
        &self.id
    }

    async fn execute(&mut self, request: &ExecutionRequest) -> Result<ExecutionResult> {
        self.channel.exec(request).await
    }

    async fn ping(&mut self) -> Result<()> {
        self.channel.ping(PING_TIMEOUT).await
    }

    async fn shutdown(&mut self) -> Result<()> {
        if self.channel.shutdown(SHUTDOWN_TIMEOUT).await
            && let Ok(status) = tokio::time::timeout(SHUTDOWN_TIMEOUT, self.child.wait()).await
        {
            let status = status?;
            debug!(worker_id = %self.id, ?status, "worker exited");
            return Ok(());
        }
        warn!(worker_id = %self.id, "worker did not shut down gracefully, killing");
        self.kill().await
    }

    async fn kill(&mut self) -> Result<()> {
        kill_process_group(&self.child);
        let status = self.child.wait().await?;
        debug!(worker_id = %self.id, ?status, "worker killed");
        Ok(())
    }
}

impl Drop for ProcessWorker {
    fn drop(&mut self) {
        // kill_on_drop only reaches the direct child.
        kill_process_group(&self.child);
    }
}

/// Launches [`ProcessWorker`]s from a [`WorkerSpec`].
pub struct ProcessLauncher {
    spec: WorkerSpec,
}

impl ProcessLauncher {
    pub fn new(spec: WorkerSpec) -> Self {
        Self { spec }
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    fn name(&self) -> &str {
        "process"
    }

    async fn launch(&self) -> Result<Box<dyn Worker>> {
        let worker = ProcessWorker::spawn(&self.spec).await?;
        Ok(Box::new(worker))
    }
}
