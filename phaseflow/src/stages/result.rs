//! Per-stage outcome records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Terminal status of a stage within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// The handler returned successfully.
    Completed,
    /// A tolerant stage finished with sub-item failures its policy accepted.
    Degraded,
    /// The handler failed outside any tolerance policy, or the policy rejected it.
    Failed,
    /// The stage exceeded its deadline.
    TimedOut,
    /// The handler observed the abort signal mid-execution.
    Aborted,
    /// The abort signal was already set when the stage was reached.
    NotStarted,
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::Degraded => write!(f, "degraded"),
            Self::Failed => write!(f, "failed"),
            Self::TimedOut => write!(f, "timed_out"),
            Self::Aborted => write!(f, "aborted"),
            Self::NotStarted => write!(f, "not_started"),
        }
    }
}

impl StageStatus {
    /// Returns true if the stage produced a usable outcome.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed | Self::Degraded)
    }

    /// Returns true if the status is a genuine fault (not an abort unwind).
    #[must_use]
    pub fn is_fault(&self) -> bool {
        matches!(self, Self::Failed | Self::TimedOut)
    }

    /// Returns true if the handler ran at all.
    #[must_use]
    pub fn was_started(&self) -> bool {
        !matches!(self, Self::NotStarted)
    }
}

/// Result of one stage. Created once, immutable thereafter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    /// Stage id.
    pub stage_id: String,
    /// Stage name.
    pub stage_name: String,
    /// Terminal status.
    pub status: StageStatus,
    /// Whether the stage counts as successful.
    pub success: bool,
    /// Output payload, when the stage produced one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    /// Error message, when the stage did not complete cleanly.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: f64,
    /// When the result was recorded.
    pub timestamp: DateTime<Utc>,
}

impl StageResult {
    fn new(
        stage_id: impl Into<String>,
        stage_name: impl Into<String>,
        status: StageStatus,
        duration_ms: f64,
    ) -> Self {
        Self {
            stage_id: stage_id.into(),
            stage_name: stage_name.into(),
            status,
            success: status.is_success(),
            output: None,
            error: None,
            duration_ms,
            timestamp: Utc::now(),
        }
    }

    /// Creates a completed result.
    #[must_use]
    pub fn completed(
        stage_id: impl Into<String>,
        stage_name: impl Into<String>,
        output: serde_json::Value,
        duration_ms: f64,
    ) -> Self {
        let mut result = Self::new(stage_id, stage_name, StageStatus::Completed, duration_ms);
        result.output = Some(output);
        result
    }

    /// Creates a degraded result.
    ///
    /// `output` is `None` when the handler itself errored but the tolerance
    /// policy still accepted the recorded sub-items.
    #[must_use]
    pub fn degraded(
        stage_id: impl Into<String>,
        stage_name: impl Into<String>,
        output: Option<serde_json::Value>,
        error: Option<String>,
        duration_ms: f64,
    ) -> Self {
        let mut result = Self::new(stage_id, stage_name, StageStatus::Degraded, duration_ms);
        result.output = output;
        result.error = error;
        result
    }

    /// Creates a failed result.
    #[must_use]
    pub fn failed(
        stage_id: impl Into<String>,
        stage_name: impl Into<String>,
        error: impl Into<String>,
        duration_ms: f64,
    ) -> Self {
        let mut result = Self::new(stage_id, stage_name, StageStatus::Failed, duration_ms);
        result.error = Some(error.into());
        result
    }

    /// Creates a timed-out result carrying any partial output.
    #[must_use]
    pub fn timed_out(
        stage_id: impl Into<String>,
        stage_name: impl Into<String>,
        error: impl Into<String>,
        partial: Option<serde_json::Value>,
        duration_ms: f64,
    ) -> Self {
        let mut result = Self::new(stage_id, stage_name, StageStatus::TimedOut, duration_ms);
        result.error = Some(error.into());
        result.output = partial;
        result
    }

    /// Creates a result for a stage that observed the abort mid-execution.
    #[must_use]
    pub fn aborted(
        stage_id: impl Into<String>,
        stage_name: impl Into<String>,
        reason: impl Into<String>,
        duration_ms: f64,
    ) -> Self {
        let mut result = Self::new(stage_id, stage_name, StageStatus::Aborted, duration_ms);
        result.error = Some(reason.into());
        result
    }

    /// Creates a result for a stage skipped because the run was aborted.
    #[must_use]
    pub fn not_started(stage_id: impl Into<String>, stage_name: impl Into<String>) -> Self {
        Self::new(stage_id, stage_name, StageStatus::NotStarted, 0.0)
    }
}
