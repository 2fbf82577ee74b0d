use std::path::{Path, PathBuf};
use std::time::Duration;

use sandbox::{DEFAULT_TIMEOUT_MS, RuntimeLimits};
use serde::{Deserialize, Serialize};

use crate::error::{HostError, HostResult};
use crate::process::WorkerSpec;

pub(crate) const DEFAULT_POOL_SIZE: usize = 2;
pub(crate) const DEFAULT_STARTUP_TIMEOUT_MS: u64 = 5000;

/// Host configuration, usually loaded from a YAML file.
///
/// Every section is optional; an empty file yields the defaults.
#[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub worker: WorkerConfig,
    pub strategy: StrategyConfig,
    pub limits: RuntimeLimits,
    pub defaults: DefaultsConfig,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Worker executable. Defaults to the running `jsbox` binary.
    pub program: Option<PathBuf>,
    /// Arguments for `program`. Defaults to `["worker"]` when `program` is unset.
    pub args: Option<Vec<String>>,
    pub startup_timeout_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            program: None,
            args: None,
            startup_timeout_ms: DEFAULT_STARTUP_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    /// A fresh worker process per request.
    #[default]
    Spawn,
    /// Pre-warmed, reusable workers.
    Pool,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    pub kind: StrategyKind,
    /// Idle capacity of the pool. Ignored by `spawn`.
    pub pool_size: usize,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            kind: StrategyKind::default(),
            pool_size: DEFAULT_POOL_SIZE,
        }
    }
}

/// Submission defaults; a host built with `ExecutionHost::from_config`
/// returns them from `default_options`.
#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DefaultsConfig {
    pub timeout_ms: u64,
    pub instrument: bool,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_TIMEOUT_MS,
            instrument: false,
        }
    }
}

/// Load a host config from a YAML file.
///
/// A relative `worker.program` containing a path separator is resolved
/// against the config file's parent directory; bare names are left for
/// `PATH` lookup.
pub async fn load(path: &Path) -> HostResult<HostConfig> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| HostError::Config(format!("read {}: {e}", path.display())))?;
    let mut config = parse(&content)
        .map_err(|e| HostError::Config(format!("parse {}: {e}", path.display())))?;
    if let Some(config_dir) = path.parent() {
        config.resolve_relative_paths(config_dir);
    }
    config.validate()?;
    Ok(config)
}

fn parse(content: &str) -> Result<HostConfig, serde_yaml_ng::Error> {
    // An empty document deserializes as unit, not as an empty mapping.
    if content.trim().is_empty() {
        return Ok(HostConfig::default());
    }
    serde_yaml_ng::from_str(content)
}

impl HostConfig {
    fn resolve_relative_paths(&mut self, config_dir: &Path) {
        if let Some(program) = &mut self.worker.program
            && program.is_relative()
            && program.components().count() > 1
        {
            *program = config_dir.join(&*program);
        }
    }

    pub fn validate(&self) -> HostResult<()> {
        if self.strategy.kind == StrategyKind::Pool && self.strategy.pool_size == 0 {
            return Err(HostError::Config("strategy.pool_size must be at least 1".into()));
        }
        if self.worker.startup_timeout_ms == 0 {
            return Err(HostError::Config(
                "worker.startup_timeout_ms must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Build the worker launch spec, defaulting to `<current exe> worker`.
    pub fn worker_spec(&self) -> HostResult<WorkerSpec> {
        let (program, default_args) = match &self.worker.program {
            Some(program) => (program.clone(), Vec::new()),
            None => (std::env::current_exe()?, vec!["worker".to_owned()]),
        };
        Ok(WorkerSpec {
            program,
            args: self.worker.args.clone().unwrap_or(default_args),
            limits: self.limits,
            startup_timeout: Duration::from_millis(self.worker.startup_timeout_ms),
        })
    }
}
