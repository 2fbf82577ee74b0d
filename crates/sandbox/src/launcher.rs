use async_trait::async_trait;

use crate::error::Result;
use crate::worker::Worker;

/// Starts new workers for a [`WorkerStrategy`].
///
/// Abstracted as a trait so strategies can be exercised against in-process
/// workers instead of spawning a process per test.
///
/// [`WorkerStrategy`]: crate::WorkerStrategy
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    /// Human-readable name for this launcher (e.g. "process").
    fn name(&self) -> &str;
    /// Start a worker and complete its handshake.
    async fn launch(&self) -> Result<Box<dyn Worker>>;
}
