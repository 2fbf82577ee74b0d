use std::io;

use clap::Args;
use exec_host::process::{ENV_MAX_STACK, ENV_MEMORY_LIMIT};
use js_worker::Evaluator;
use sandbox::{DEFAULT_MAX_STACK_BYTES, DEFAULT_MEMORY_LIMIT_BYTES, RuntimeLimits};
use tracing::debug;

#[derive(Args)]
pub struct WorkerArgs {
    /// QuickJS heap limit per run in bytes (0 = unlimited)
    #[arg(long, env = ENV_MEMORY_LIMIT, default_value_t = DEFAULT_MEMORY_LIMIT_BYTES)]
    memory_limit_bytes: usize,
    /// QuickJS stack limit per run in bytes (0 = unlimited)
    #[arg(long, env = ENV_MAX_STACK, default_value_t = DEFAULT_MAX_STACK_BYTES)]
    max_stack_bytes: usize,
}

/// Serve the worker protocol on stdin/stdout until EOF or shutdown.
pub fn run_worker(args: WorkerArgs) -> io::Result<()> {
    let limits = RuntimeLimits {
        memory_limit_bytes: args.memory_limit_bytes,
        max_stack_bytes: args.max_stack_bytes,
    };
    debug!(?limits, pid = std::process::id(), "worker starting");
    let evaluator = Evaluator::new(limits);
    js_worker::serve(io::stdin().lock(), io::stdout().lock(), &evaluator)
}
