//! Manifest assembly and the run-level success rules.

use crate::cancellation::AbortState;
use crate::config::RuntimeMode;
use crate::errors::Result;
use crate::stages::{StageResult, StageStatus};
use crate::timeout::TimeoutRecord;
use crate::tolerance::ErrorToleranceState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use uuid::Uuid;

/// Tolerance tallies for one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToleranceSummary {
    /// Expected sub-items.
    pub total: u64,
    /// Sub-items that succeeded.
    pub succeeded: u64,
    /// Sub-items that failed.
    pub failed: u64,
    /// `failed / (succeeded + failed)`.
    pub failure_rate: f64,
}

impl From<&ErrorToleranceState> for ToleranceSummary {
    fn from(state: &ErrorToleranceState) -> Self {
        Self {
            total: state.total,
            succeeded: state.succeeded,
            failed: state.failed,
            failure_rate: state.failure_rate(),
        }
    }
}

/// Per-stage line of the manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSummary {
    /// Stage id.
    pub stage_id: String,
    /// Stage name.
    pub stage_name: String,
    /// Terminal status.
    pub status: StageStatus,
    /// Whether the stage counts as successful.
    pub success: bool,
    /// Error message, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Duration in milliseconds.
    pub duration_ms: f64,
    /// When the stage result was recorded.
    pub timestamp: DateTime<Utc>,
}

impl From<&StageResult> for StageSummary {
    fn from(result: &StageResult) -> Self {
        Self {
            stage_id: result.stage_id.clone(),
            stage_name: result.stage_name.clone(),
            status: result.status,
            success: result.success,
            error: result.error.clone(),
            duration_ms: result.duration_ms,
            timestamp: result.timestamp,
        }
    }
}

/// The final structured record of one orchestration run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionManifest {
    /// Run identifier.
    pub run_id: Uuid,
    /// Overall success.
    pub success: bool,
    /// Set when a non-strict run accepted at least one degraded stage.
    pub partial_success: bool,
    /// Runtime mode the run used.
    pub runtime_mode: RuntimeMode,
    /// Stages that finished successfully (completed or degraded).
    pub stages_completed: usize,
    /// Stages declared.
    pub stages_total: usize,
    /// Whether any stage timed out.
    pub has_timeout: bool,
    /// Whether any stage failed.
    pub has_failure: bool,
    /// Whether the abort signal was set.
    pub aborted: bool,
    /// First abort reason.
    pub abort_reason: Option<String>,
    /// When the abort was first requested.
    pub abort_timestamp: Option<DateTime<Utc>>,
    /// Stages that hit their deadline.
    pub timeout_stages: Vec<TimeoutRecord>,
    /// Tolerance tallies per tolerant stage.
    pub error_tolerance: BTreeMap<String, ToleranceSummary>,
    /// Per-stage summaries in declared order.
    pub stages: Vec<StageSummary>,
    /// Run start.
    pub started_at: DateTime<Utc>,
    /// Run end.
    pub finished_at: DateTime<Utc>,
    /// Total duration in milliseconds.
    pub duration_ms: f64,
}

impl ExecutionManifest {
    /// Serializes to pretty-printed JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parses a manifest from JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is malformed.
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Writes the manifest as pretty JSON to `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn write_to_path(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, self.to_json_pretty()?)?;
        Ok(())
    }

    /// Reads a manifest from `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the read or parse fails.
    pub fn read_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    /// Returns the summary for `stage_id`.
    #[must_use]
    pub fn stage(&self, stage_id: &str) -> Option<&StageSummary> {
        self.stages.iter().find(|s| s.stage_id == stage_id)
    }
}

/// Accumulates run state and reduces it into an [`ExecutionManifest`].
#[derive(Debug, Clone)]
pub struct ManifestBuilder {
    run_id: Uuid,
    runtime_mode: RuntimeMode,
    stages_total: usize,
    started_at: DateTime<Utc>,
    results: Vec<StageResult>,
    timeouts: Vec<TimeoutRecord>,
    tolerance: BTreeMap<String, ErrorToleranceState>,
    abort: AbortState,
}

impl ManifestBuilder {
    /// Starts a manifest for a run of `stages_total` stages.
    #[must_use]
    pub fn new(run_id: Uuid, runtime_mode: RuntimeMode, stages_total: usize) -> Self {
        Self {
            run_id,
            runtime_mode,
            stages_total,
            started_at: Utc::now(),
            results: Vec::new(),
            timeouts: Vec::new(),
            tolerance: BTreeMap::new(),
            abort: AbortState::default(),
        }
    }

    /// Overrides the run start time.
    #[must_use]
    pub fn started_at(mut self, at: DateTime<Utc>) -> Self {
        self.started_at = at;
        self
    }

    /// Sets the stage results, in declared order.
    #[must_use]
    pub fn results(mut self, results: Vec<StageResult>) -> Self {
        self.results = results;
        self
    }

    /// Adds one stage result.
    pub fn push_result(&mut self, result: StageResult) {
        self.results.push(result);
    }

    /// Adds a timeout record.
    pub fn push_timeout(&mut self, record: TimeoutRecord) {
        self.timeouts.push(record);
    }

    /// Sets the tolerance tallies.
    #[must_use]
    pub fn tolerance(mut self, states: BTreeMap<String, ErrorToleranceState>) -> Self {
        self.tolerance = states;
        self
    }

    /// Sets the abort state.
    #[must_use]
    pub fn abort(mut self, state: AbortState) -> Self {
        self.abort = state;
        self
    }

    /// Reduces everything into the manifest.
    ///
    /// `success` requires every declared stage to have finished successfully
    /// with no fault and no abort. `partial_success` is set when a non-strict
    /// run accepted a degraded stage.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn build(self, finished_at: DateTime<Utc>) -> ExecutionManifest {
        let stages_completed = self.results.iter().filter(|r| r.status.is_success()).count();
        let has_timeout = !self.timeouts.is_empty()
            || self.results.iter().any(|r| r.status == StageStatus::TimedOut);
        let has_failure = self.results.iter().any(|r| r.status == StageStatus::Failed);

        let success = stages_completed == self.stages_total
            && !has_failure
            && !has_timeout
            && !self.abort.aborted;
        let partial_success = !self.runtime_mode.is_strict()
            && self
                .results
                .iter()
                .any(|r| r.status == StageStatus::Degraded);

        let duration_ms = (finished_at - self.started_at)
            .num_microseconds()
            .map_or(0.0, |us| us as f64 / 1000.0)
            .max(0.0);

        ExecutionManifest {
            run_id: self.run_id,
            success,
            partial_success,
            runtime_mode: self.runtime_mode,
            stages_completed,
            stages_total: self.stages_total,
            has_timeout,
            has_failure,
            aborted: self.abort.aborted,
            abort_reason: self.abort.reason,
            abort_timestamp: self.abort.timestamp,
            timeout_stages: self.timeouts,
            error_tolerance: self
                .tolerance
                .iter()
                .map(|(id, state)| (id.clone(), ToleranceSummary::from(state)))
                .collect(),
            stages: self.results.iter().map(StageSummary::from).collect(),
            started_at: self.started_at,
            finished_at,
            duration_ms,
        }
    }
}
