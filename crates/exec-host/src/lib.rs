//! Host side of the jsbox execution engine.
//!
//! [`ExecutionHost`] accepts code submissions, hands each to a worker
//! obtained from a [`WorkerStrategy`](sandbox::WorkerStrategy), and enforces
//! the request's time budget and cancellation by killing the worker's
//! process group.

pub mod channel;
pub mod config;
mod error;
pub mod host;
pub mod pool;
pub mod process;
pub mod spawn;
#[cfg(test)]
mod testing;

pub use config::{HostConfig, StrategyKind};
pub use error::{HostError, HostResult};
pub use host::{ExecutionHost, SubmitOptions};
pub use pool::WorkerPool;
pub use process::{ProcessLauncher, ProcessWorker, WorkerSpec};
pub use spawn::SpawnPerRequest;
