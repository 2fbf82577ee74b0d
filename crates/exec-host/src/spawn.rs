use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use sandbox::{Result, SandboxError, Worker, WorkerLauncher, WorkerStrategy};
use tracing::warn;

/// A fresh worker for every request. Nothing is ever reused.
pub struct SpawnPerRequest {
    launcher: Arc<dyn WorkerLauncher>,
    active: AtomicBool,
}

impl SpawnPerRequest {
    pub fn new(launcher: Arc<dyn WorkerLauncher>) -> Self {
        Self {
            launcher,
            active: AtomicBool::new(true),
        }
    }
}

#[async_trait]
impl WorkerStrategy for SpawnPerRequest {
    fn name(&self) -> &str {
        "spawn"
    }

    async fn acquire(&self) -> Result<Box<dyn Worker>> {
        if !self.active.load(Ordering::Acquire) {
            return Err(SandboxError::ShutDown);
        }
        self.launcher.launch().await
    }

    async fn release(&self, mut worker: Box<dyn Worker>) {
        if let Err(e) = worker.shutdown().await {
            warn!(worker_id = %worker.id(), error = %e, "failed to stop worker");
        }
    }

    async fn discard(&self, mut worker: Box<dyn Worker>) {
        if let Err(e) = worker.kill().await {
            warn!(worker_id = %worker.id(), error = %e, "failed to kill worker");
        }
    }

    async fn shutdown(&self) {
        self.active.store(false, Ordering::Release);
    }
}
