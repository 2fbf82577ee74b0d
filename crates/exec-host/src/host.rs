//! Request dispatch with time budgets and cancellation.
//!
//! Each submission takes a worker from the configured [`WorkerStrategy`],
//! sends it the request and races the response against the request's timer
//! and its cancellation token. Whichever finishes first decides the single
//! result for that id; a worker that lost the race is killed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use sandbox::{ErrorKind, ExecutionRequest, ExecutionResult, WorkerStrategy};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{DefaultsConfig, HostConfig, StrategyKind};
use crate::error::HostResult;
use crate::pool::WorkerPool;
use crate::process::ProcessLauncher;
use crate::spawn::SpawnPerRequest;

/// Per-submission options for [`ExecutionHost::submit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmitOptions {
    pub timeout_ms: u64,
    pub instrument: bool,
}

impl Default for SubmitOptions {
    fn default() -> Self {
        Self {
            timeout_ms: sandbox::DEFAULT_TIMEOUT_MS,
            instrument: false,
        }
    }
}

impl From<&DefaultsConfig> for SubmitOptions {
    fn from(defaults: &DefaultsConfig) -> Self {
        Self {
            timeout_ms: defaults.timeout_ms,
            instrument: defaults.instrument,
        }
    }
}

enum Outcome {
    Finished(sandbox::Result<ExecutionResult>),
    TimedOut,
    Cancelled,
}

fn elapsed_ms(since: Instant) -> f64 {
    since.elapsed().as_secs_f64() * 1000.0
}

type InFlight = Mutex<HashMap<String, CancellationToken>>;

/// Removes a request from the in-flight table when its submission ends,
/// however it ends.
struct InFlightGuard<'a> {
    table: &'a InFlight,
    id: String,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        lock(self.table).remove(&self.id);
    }
}

fn lock(table: &InFlight) -> MutexGuard<'_, HashMap<String, CancellationToken>> {
    // The table holds no invariants a panicking holder could break.
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Accepts code submissions and produces exactly one result per id.
pub struct ExecutionHost {
    strategy: Arc<dyn WorkerStrategy>,
    defaults: SubmitOptions,
    in_flight: InFlight,
}

impl ExecutionHost {
    pub fn new(strategy: Arc<dyn WorkerStrategy>) -> Self {
        Self {
            strategy,
            defaults: SubmitOptions::default(),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the options returned by [`Self::default_options`].
    pub fn with_defaults(mut self, defaults: SubmitOptions) -> Self {
        self.defaults = defaults;
        self
    }

    /// Submission options taken from the host's configured `defaults`.
    pub fn default_options(&self) -> SubmitOptions {
        self.defaults
    }

    /// Build a host with the process launcher and strategy named in `config`.
    pub async fn from_config(config: &HostConfig) -> HostResult<Self> {
        config.validate()?;
        let launcher = Arc::new(ProcessLauncher::new(config.worker_spec()?));
        let strategy: Arc<dyn WorkerStrategy> = match config.strategy.kind {
            StrategyKind::Spawn => Arc::new(SpawnPerRequest::new(launcher)),
            StrategyKind::Pool => {
                Arc::new(WorkerPool::create(launcher, config.strategy.pool_size).await)
            }
        };
        let defaults = SubmitOptions::from(&config.defaults);
        info!(
            strategy = strategy.name(),
            timeout_ms = defaults.timeout_ms,
            "execution host ready"
        );
        Ok(Self::new(strategy).with_defaults(defaults))
    }

    /// Submit code under a freshly generated id.
    pub async fn submit(&self, code: impl Into<String>, options: SubmitOptions) -> ExecutionResult {
        let request = ExecutionRequest::new(uuid::Uuid::new_v4().to_string(), code)
            .with_timeout_ms(options.timeout_ms)
            .with_instrument(options.instrument);
        self.submit_request(request).await
    }

    /// Run a request to completion, timeout or cancellation.
    ///
    /// A request whose id is already in flight resolves immediately with an
    /// error and is never dispatched.
    pub async fn submit_request(&self, request: ExecutionRequest) -> ExecutionResult {
        let token = CancellationToken::new();
        {
            let mut table = lock(&self.in_flight);
            if table.contains_key(&request.id) {
                warn!(request_id = %request.id, "duplicate in-flight id rejected");
                return ExecutionResult::failed(
                    request.id.as_str(),
                    ErrorKind::Worker,
                    format!("request id {} is already in flight", request.id),
                    0.0,
                );
            }
            table.insert(request.id.clone(), token.clone());
        }
        let _guard = InFlightGuard {
            table: &self.in_flight,
            id: request.id.clone(),
        };

        self.dispatch(&request, &token).await
    }

    async fn dispatch(&self, request: &ExecutionRequest, token: &CancellationToken) -> ExecutionResult {
        let id = request.id.as_str();
        let submitted = Instant::now();

        let acquired = tokio::select! {
            biased;
            () = token.cancelled() => None,
            acquired = self.strategy.acquire() => Some(acquired),
        };
        let mut worker = match acquired {
            None => {
                info!(request_id = %id, "cancelled before dispatch");
                return cancelled(id, elapsed_ms(submitted));
            }
            Some(Err(e)) => {
                warn!(request_id = %id, error = %e, "no worker available");
                return ExecutionResult::failed(
                    id,
                    ErrorKind::Worker,
                    format!("worker unavailable: {e}"),
                    elapsed_ms(submitted),
                );
            }
            Some(Ok(worker)) => worker,
        };

        let timeout_ms = request.timeout_ms;
        let dispatched = Instant::now();
        debug!(request_id = %id, worker_id = %worker.id(), timeout_ms, "dispatching");

        let outcome = tokio::select! {
            biased;
            result = worker.execute(request) => Outcome::Finished(result),
            () = tokio::time::sleep(Duration::from_millis(timeout_ms)) => Outcome::TimedOut,
            () = token.cancelled() => Outcome::Cancelled,
        };

        match outcome {
            Outcome::Finished(Ok(result)) => {
                debug!(
                    request_id = %id,
                    worker_id = %worker.id(),
                    duration_ms = result.duration_ms,
                    ok = result.is_ok(),
                    "execution finished"
                );
                self.strategy.release(worker).await;
                result
            }
            Outcome::Finished(Err(e)) => {
                warn!(request_id = %id, worker_id = %worker.id(), error = %e, "worker failed");
                let duration_ms = elapsed_ms(dispatched);
                self.strategy.discard(worker).await;
                ExecutionResult::failed(id, ErrorKind::Worker, format!("worker failed: {e}"), duration_ms)
            }
            Outcome::TimedOut => {
                info!(request_id = %id, worker_id = %worker.id(), timeout_ms, "execution timed out");
                let duration_ms = elapsed_ms(dispatched);
                self.strategy.discard(worker).await;
                ExecutionResult::failed(
                    id,
                    ErrorKind::Timeout,
                    format!("execution timed out after {timeout_ms}ms"),
                    duration_ms,
                )
            }
            Outcome::Cancelled => {
                info!(request_id = %id, worker_id = %worker.id(), "execution cancelled");
                let duration_ms = elapsed_ms(dispatched);
                self.strategy.discard(worker).await;
                cancelled(id, duration_ms)
            }
        }
    }

    /// Cancel an in-flight request. Returns whether one with this id existed.
    pub fn cancel(&self, id: &str) -> bool {
        match lock(&self.in_flight).get(id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Number of submissions that have not resolved yet.
    pub fn in_flight(&self) -> usize {
        lock(&self.in_flight).len()
    }

    /// Cancel everything in flight and shut the strategy down.
    pub async fn shutdown(&self) {
        let pending: Vec<CancellationToken> = lock(&self.in_flight).values().cloned().collect();
        if !pending.is_empty() {
            info!(count = pending.len(), "cancelling in-flight requests");
        }
        for token in pending {
            token.cancel();
        }
        self.strategy.shutdown().await;
    }
}

fn cancelled(id: &str, duration_ms: f64) -> ExecutionResult {
    ExecutionResult::failed(id, ErrorKind::Cancelled, "execution cancelled", duration_ms)
}
