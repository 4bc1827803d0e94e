//! Deadline enforcement with an early warning.

use crate::cancellation::CancellationToken;
use crate::config::{OrchestratorConfig, RuntimeMode, TimeoutTable};
use crate::errors::StageTimeoutError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

/// Upper bound on a single deadline, so `Instant + Duration` cannot overflow.
const MAX_TIMEOUT: Duration = Duration::from_secs(60 * 60 * 24 * 365);

/// Emitted once when a stage passes the warning threshold of its timeout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeoutWarning {
    /// Stage id.
    pub stage_id: String,
    /// Stage name.
    pub stage_name: String,
    /// Effective timeout.
    pub timeout_s: f64,
    /// Seconds elapsed when the warning fired.
    pub elapsed_s: f64,
    /// Seconds left before the deadline.
    pub remaining_s: f64,
}

/// A stage that hit its deadline, as reported in the manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeoutRecord {
    /// Stage id.
    pub stage_id: String,
    /// Stage name.
    pub stage_name: String,
    /// Effective timeout.
    pub timeout_s: f64,
    /// Seconds elapsed when the deadline fired.
    pub elapsed_s: f64,
}

impl From<&StageTimeoutError> for TimeoutRecord {
    fn from(err: &StageTimeoutError) -> Self {
        Self {
            stage_id: err.stage_id.clone(),
            stage_name: err.stage_name.clone(),
            timeout_s: err.timeout_s,
            elapsed_s: err.elapsed_s,
        }
    }
}

/// Callback invoked when the warning threshold is crossed.
pub type WarningCallback = Box<dyn Fn(&TimeoutWarning) + Send + Sync>;

/// Side channels a guarded execution reports through.
#[derive(Default)]
pub struct TimeoutHooks {
    cancel: Option<Arc<CancellationToken>>,
    partial: Option<Arc<Mutex<Option<serde_json::Value>>>>,
    on_warning: Option<WarningCallback>,
}

impl fmt::Debug for TimeoutHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeoutHooks")
            .field("cancel", &self.cancel.is_some())
            .field("partial", &self.partial.is_some())
            .field("on_warning", &self.on_warning.is_some())
            .finish()
    }
}

impl TimeoutHooks {
    /// Creates empty hooks.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancels `token` when the deadline fires.
    #[must_use]
    pub fn with_cancel(mut self, token: Arc<CancellationToken>) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Reads the partial result from `slot` when the deadline fires.
    #[must_use]
    pub fn with_partial(mut self, slot: Arc<Mutex<Option<serde_json::Value>>>) -> Self {
        self.partial = Some(slot);
        self
    }

    /// Invokes `callback` when the warning threshold is crossed.
    #[must_use]
    pub fn on_warning<F>(mut self, callback: F) -> Self
    where
        F: Fn(&TimeoutWarning) + Send + Sync + 'static,
    {
        self.on_warning = Some(Box::new(callback));
        self
    }
}

/// Resolves per-stage timeouts and enforces them.
#[derive(Debug, Clone)]
pub struct TimeoutGuard {
    table: TimeoutTable,
    warning_threshold: f64,
}

impl TimeoutGuard {
    /// Creates a guard over a timeout table.
    ///
    /// `warning_threshold` is the fraction of the timeout at which a warning
    /// is emitted.
    #[must_use]
    pub fn new(table: TimeoutTable, warning_threshold: f64) -> Self {
        Self {
            table,
            warning_threshold: warning_threshold.clamp(0.0, 1.0),
        }
    }

    /// Creates a guard from orchestrator configuration.
    #[must_use]
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self::new(config.timeouts.clone(), config.warning_threshold)
    }

    /// Returns the warning threshold fraction.
    #[must_use]
    pub fn warning_threshold(&self) -> f64 {
        self.warning_threshold
    }

    /// Returns the unscaled timeout for a stage.
    ///
    /// The table entry wins over the descriptor's own base timeout, which
    /// wins over the table default.
    #[must_use]
    pub fn base_timeout(&self, stage_id: &str, descriptor_base: Option<f64>) -> f64 {
        self.table
            .get(stage_id)
            .or(descriptor_base)
            .unwrap_or(self.table.default_timeout_s)
    }

    /// Returns `base_timeout(stage_id) * mode.timeout_multiplier()`.
    #[must_use]
    pub fn get_phase_timeout(&self, stage_id: &str, mode: RuntimeMode) -> f64 {
        self.resolve(stage_id, None, mode)
    }

    /// Like [`get_phase_timeout`](Self::get_phase_timeout), with a descriptor fallback.
    #[must_use]
    pub fn resolve(&self, stage_id: &str, descriptor_base: Option<f64>, mode: RuntimeMode) -> f64 {
        self.base_timeout(stage_id, descriptor_base) * mode.timeout_multiplier()
    }

    /// Runs `work` under a deadline of `timeout_s` seconds.
    ///
    /// A warning is logged (and passed to the hooks) once `work` has run
    /// for `warning_threshold * timeout_s` without completing; it does not
    /// interrupt the work. At the deadline the hooks' token is cancelled,
    /// `work` is dropped and a [`StageTimeoutError`] carrying the last
    /// partial result is returned.
    ///
    /// # Errors
    ///
    /// Returns [`StageTimeoutError`] if `work` does not finish in time.
    pub async fn execute_with_timeout<F>(
        &self,
        work: F,
        timeout_s: f64,
        stage_id: &str,
        stage_name: &str,
        hooks: &TimeoutHooks,
    ) -> Result<F::Output, StageTimeoutError>
    where
        F: Future,
    {
        let limit = to_duration(timeout_s);
        let started = Instant::now();
        let deadline = started + limit;
        let warn_at = started + limit.mul_f64(self.warning_threshold);
        let mut warned = self.warning_threshold >= 1.0;

        tokio::pin!(work);
        loop {
            tokio::select! {
                biased;
                output = &mut work => {
                    debug!(
                        stage_id,
                        elapsed_s = started.elapsed().as_secs_f64(),
                        "Stage finished within its deadline"
                    );
                    return Ok(output);
                }
                () = sleep_until(warn_at), if !warned => {
                    warned = true;
                    let elapsed_s = started.elapsed().as_secs_f64();
                    let warning = TimeoutWarning {
                        stage_id: stage_id.to_string(),
                        stage_name: stage_name.to_string(),
                        timeout_s,
                        elapsed_s,
                        remaining_s: (timeout_s - elapsed_s).max(0.0),
                    };
                    warn!(
                        stage_id,
                        stage_name,
                        elapsed_s,
                        remaining_s = warning.remaining_s,
                        timeout_s,
                        "Stage approaching timeout"
                    );
                    if let Some(callback) = &hooks.on_warning {
                        callback(&warning);
                    }
                }
                () = sleep_until(deadline) => {
                    let elapsed_s = started.elapsed().as_secs_f64();
                    if let Some(token) = &hooks.cancel {
                        token.cancel(format!("Stage '{stage_id}' exceeded {timeout_s:.3}s timeout"));
                    }
                    let partial_result = hooks.partial.as_ref().and_then(|slot| slot.lock().clone());
                    warn!(stage_id, stage_name, elapsed_s, timeout_s, "Stage timed out");
                    return Err(StageTimeoutError {
                        stage_id: stage_id.to_string(),
                        stage_name: stage_name.to_string(),
                        timeout_s,
                        elapsed_s,
                        partial_result,
                    });
                }
            }
        }
    }
}

fn to_duration(seconds: f64) -> Duration {
    Duration::try_from_secs_f64(seconds)
        .unwrap_or(Duration::ZERO)
        .min(MAX_TIMEOUT)
}
