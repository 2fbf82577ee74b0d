use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use sandbox::{Result, SandboxError, Worker, WorkerLauncher, WorkerStrategy};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// Pre-warmed pool of reusable workers.
///
/// [`acquire`](WorkerStrategy::acquire) pops an idle worker and checks it
/// with a `ping`, dropping (and killing) any that fail, then falls back to
/// launching on demand. Workers come back through `release` only after a
/// run that completed normally; the pool keeps at most `size` idle.
///
/// Reuse is safe because the worker builds a fresh JS runtime for every
/// request.
pub struct WorkerPool {
    launcher: Arc<dyn WorkerLauncher>,
    idle: Mutex<VecDeque<Box<dyn Worker>>>,
    size: usize,
    active: AtomicBool,
}

impl WorkerPool {
    /// Create a pool, launching `size` workers in parallel.
    ///
    /// Launch failures are logged and leave the pool smaller; the missing
    /// workers are started on demand later.
    pub async fn create(launcher: Arc<dyn WorkerLauncher>, size: usize) -> Self {
        info!(size, launcher = launcher.name(), "initializing worker pool");

        let mut idle = VecDeque::with_capacity(size);
        if size > 0 {
            let mut join_set = tokio::task::JoinSet::new();
            for _ in 0..size {
                let l = Arc::clone(&launcher);
                join_set.spawn(async move { l.launch().await });
            }
            while let Some(result) = join_set.join_next().await {
                match result {
                    Ok(Ok(worker)) => idle.push_back(worker),
                    Ok(Err(e)) => error!(error = %e, "failed to launch worker"),
                    Err(e) => error!(error = %e, "worker launch task panicked"),
                }
            }
        }

        let available = idle.len();
        if available < size {
            warn!(
                requested = size,
                launched = available,
                "worker pool initialized with fewer workers than requested"
            );
        }
        info!(available, "worker pool initialized");

        Self {
            launcher,
            idle: Mutex::new(idle),
            size,
            active: AtomicBool::new(true),
        }
    }

    /// Number of workers ready for immediate use.
    pub async fn idle_count(&self) -> usize {
        self.idle.lock().await.len()
    }

    async fn pop_idle(&self) -> Option<Box<dyn Worker>> {
        self.idle.lock().await.pop_front()
    }
}

async fn kill(mut worker: Box<dyn Worker>) {
    if let Err(e) = worker.kill().await {
        warn!(worker_id = %worker.id(), error = %e, "failed to kill worker");
    }
}

async fn stop(mut worker: Box<dyn Worker>) {
    if let Err(e) = worker.shutdown().await {
        warn!(worker_id = %worker.id(), error = %e, "failed to stop worker");
    }
}

#[async_trait]
impl WorkerStrategy for WorkerPool {
    fn name(&self) -> &str {
        "pool"
    }

    async fn acquire(&self) -> Result<Box<dyn Worker>> {
        if !self.active.load(Ordering::Acquire) {
            return Err(SandboxError::ShutDown);
        }

        while let Some(mut worker) = self.pop_idle().await {
            match worker.ping().await {
                Ok(()) => return Ok(worker),
                Err(e) => {
                    warn!(worker_id = %worker.id(), error = %e, "idle worker failed health check");
                    kill(worker).await;
                }
            }
        }

        info!("no idle worker, launching on demand");
        self.launcher.launch().await
    }

    async fn release(&self, worker: Box<dyn Worker>) {
        {
            // `active` only flips under this lock, so a shutdown cannot drain
            // the queue between the check and the push.
            let mut idle = self.idle.lock().await;
            if self.active.load(Ordering::Acquire) && idle.len() < self.size {
                idle.push_back(worker);
                return;
            }
        }
        stop(worker).await;
    }

    async fn discard(&self, worker: Box<dyn Worker>) {
        kill(worker).await;
    }

    async fn shutdown(&self) {
        let workers: Vec<_> = {
            let mut idle = self.idle.lock().await;
            if !self.active.swap(false, Ordering::AcqRel) {
                return;
            }
            idle.drain(..).collect()
        };
        info!(count = workers.len(), "shutting down worker pool");
        for worker in workers {
            stop(worker).await;
        }
    }
}
