use async_trait::async_trait;

use crate::error::Result;
use crate::worker::Worker;

/// Worker lifecycle policy: where workers come from and what happens to
/// them after a run.
#[async_trait]
pub trait WorkerStrategy: Send + Sync {
    /// Human-readable name for this strategy (e.g. "spawn", "pool").
    fn name(&self) -> &str;
    /// Obtain a worker that is ready to accept a request.
    async fn acquire(&self) -> Result<Box<dyn Worker>>;
    /// Return a worker whose last run completed normally.
    async fn release(&self, worker: Box<dyn Worker>);
    /// Return a worker that timed out, was cancelled, or failed. The
    /// strategy must terminate it; it is never reused.
    async fn discard(&self, worker: Box<dyn Worker>);
    /// Release all strategy-level resources. Later `acquire` calls fail.
    async fn shutdown(&self);
}
