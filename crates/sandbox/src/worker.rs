use async_trait::async_trait;

use crate::error::Result;
use crate::types::{ExecutionRequest, ExecutionResult};

/// An isolated execution context reachable only through message passing.
///
/// A worker serves one request at a time. The host owns it exclusively for
/// the duration of a run and hands it back to its [`WorkerStrategy`] after.
///
/// [`WorkerStrategy`]: crate::WorkerStrategy
#[async_trait]
pub trait Worker: Send {
    // -- identity --
    fn id(&self) -> &str;

    // -- operations --
    /// Send a request and wait for the worker's single response.
    ///
    /// Not cancel-safe: dropping the future mid-flight leaves the channel in
    /// an undefined state, so the worker must be killed afterwards.
    async fn execute(&mut self, request: &ExecutionRequest) -> Result<ExecutionResult>;
    /// Round-trip liveness check.
    async fn ping(&mut self) -> Result<()>;

    // -- lifecycle --
    /// Ask the worker to exit and wait for it.
    async fn shutdown(&mut self) -> Result<()>;
    /// Forcibly terminate the worker. Never blocks on the worker's cooperation.
    async fn kill(&mut self) -> Result<()>;
}
