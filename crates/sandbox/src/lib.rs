mod config;
mod error;
mod launcher;
mod strategy;
mod types;
mod worker;

pub use config::{DEFAULT_MAX_STACK_BYTES, DEFAULT_MEMORY_LIMIT_BYTES, RuntimeLimits};
pub use error::{Result, SandboxError};
pub use launcher::WorkerLauncher;
pub use strategy::WorkerStrategy;
pub use types::{
    DEFAULT_TIMEOUT_MS, ErrorKind, ExecutionRequest, ExecutionResult, LogEntry, LogKind,
    TraceEvent,
};
pub use worker::Worker;
