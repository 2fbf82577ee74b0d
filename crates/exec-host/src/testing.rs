//! In-memory workers for strategy and host unit tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use sandbox::{
    ErrorKind, ExecutionRequest, ExecutionResult, LogEntry, LogKind, Result, SandboxError,
    Worker, WorkerLauncher,
};

#[derive(Default)]
struct Counters {
    launched: AtomicUsize,
    stopped: AtomicUsize,
    killed: AtomicUsize,
    fail_pings: AtomicBool,
    fail_launches: AtomicBool,
}

/// Launches [`FakeWorker`]s and counts what happens to them.
#[derive(Default)]
pub struct FakeLauncher {
    counters: Arc<Counters>,
}

impl FakeLauncher {
    pub fn launched(&self) -> usize {
        self.counters.launched.load(Ordering::SeqCst)
    }

    pub fn stopped(&self) -> usize {
        self.counters.stopped.load(Ordering::SeqCst)
    }

    pub fn killed(&self) -> usize {
        self.counters.killed.load(Ordering::SeqCst)
    }

    pub fn fail_pings(&self) {
        self.counters.fail_pings.store(true, Ordering::SeqCst);
    }

    pub fn fail_launches(&self) {
        self.counters.fail_launches.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl WorkerLauncher for FakeLauncher {
    fn name(&self) -> &str {
        "fake"
    }

    async fn launch(&self) -> Result<Box<dyn Worker>> {
        if self.counters.fail_launches.load(Ordering::SeqCst) {
            return Err(SandboxError::SpawnFailed("launch disabled".into()));
        }
        let n = self.counters.launched.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeWorker {
            id: format!("fake-{n}"),
            counters: Arc::clone(&self.counters),
        }))
    }
}

/// Interprets a tiny command language instead of JavaScript:
///
/// - `sleep:<ms>` waits, then succeeds
/// - `hang` never answers
/// - `crash` fails as if the worker died
/// - `throw:<msg>` reports a runtime error
/// - anything else is logged back verbatim
pub struct FakeWorker {
    id: String,
    counters: Arc<Counters>,
}

#[async_trait]
impl Worker for FakeWorker {
    fn id(&self) -> &str {
        &self.id
    }

    async fn execute(&mut self, request: &ExecutionRequest) -> Result<ExecutionResult> {
        let code = request.code.as_str();
        if let Some(ms) = code.strip_prefix("sleep:") {
            let ms = ms.parse().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
        } else if code == "hang" {
            std::future::pending::<()>().await;
        } else if code == "crash" {
            return Err(SandboxError::WorkerExited);
        } else if let Some(msg) = code.strip_prefix("throw:") {
            return Ok(ExecutionResult::failed(
                request.id.as_str(),
                ErrorKind::Runtime,
                format!("Error: {msg}"),
                0.1,
            ));
        }
        Ok(ExecutionResult {
            id: request.id.clone(),
            logs: vec![LogEntry {
                kind: LogKind::Log,
                text: code.to_owned(),
                timestamp_ms: 0.0,
            }],
            result: None,
            error: None,
            error_kind: None,
            duration_ms: 0.1,
            timeline: None,
        })
    }

    async fn ping(&mut self) -> Result<()> {
        if self.counters.fail_pings.load(Ordering::SeqCst) {
            return Err(SandboxError::Protocol("ping failed".into()));
        }
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.counters.stopped.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn kill(&mut self) -> Result<()> {
        self.counters.killed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
