use serde::{Deserialize, Serialize};

/// Default QuickJS heap limit per run (64 MiB).
pub const DEFAULT_MEMORY_LIMIT_BYTES: usize = 64 * 1024 * 1024;

/// Default QuickJS stack limit per run (1 MiB).
pub const DEFAULT_MAX_STACK_BYTES: usize = 1024 * 1024;

/// Limits applied to the JS runtime built for every run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeLimits {
    pub memory_limit_bytes: usize,
    pub max_stack_bytes: usize,
}

impl Default for RuntimeLimits {
    fn default() -> Self {
        Self {
            memory_limit_bytes: DEFAULT_MEMORY_LIMIT_BYTES,
            max_stack_bytes: DEFAULT_MAX_STACK_BYTES,
        }
    }
}
