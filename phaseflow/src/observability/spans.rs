//! Span attributes for runs and stages.

use crate::config::RuntimeMode;
use crate::stages::{ExecutionMode, StageDescriptor};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::time::Instant;
use tracing::{info_span, Span};
use uuid::Uuid;

/// Attributes attached to the span of one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSpanAttributes {
    /// Run identifier.
    pub run_id: Uuid,
    /// Runtime mode of the run.
    pub runtime_mode: RuntimeMode,
    /// Number of declared stages.
    pub stages_total: usize,
}

impl RunSpanAttributes {
    /// Creates run attributes.
    #[must_use]
    pub const fn new(run_id: Uuid, runtime_mode: RuntimeMode, stages_total: usize) -> Self {
        Self {
            run_id,
            runtime_mode,
            stages_total,
        }
    }

    /// Flattens into dotted keys for exporters.
    #[must_use]
    pub fn to_fields(&self) -> BTreeMap<&'static str, String> {
        BTreeMap::from([
            ("run.id", self.run_id.to_string()),
            ("run.runtime_mode", self.runtime_mode.to_string()),
            ("run.stages_total", self.stages_total.to_string()),
        ])
    }

    /// Opens the `run` span.
    #[must_use]
    pub fn span(&self) -> Span {
        info_span!(
            "run",
            run_id = %self.run_id,
            runtime_mode = %self.runtime_mode,
            stages_total = self.stages_total,
        )
    }
}

/// Attributes attached to the span of one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSpanAttributes {
    /// Stage id.
    pub stage_id: String,
    /// Stage name.
    pub stage_name: String,
    /// How the handler runs.
    pub mode: ExecutionMode,
    /// Resolved timeout in seconds.
    pub timeout_s: f64,
    /// Whether the stage tallies sub-item failures.
    pub tolerant: bool,
}

impl StageSpanAttributes {
    /// Builds attributes for `stage` with its resolved timeout.
    #[must_use]
    pub fn for_stage(stage: &StageDescriptor, timeout_s: f64) -> Self {
        Self {
            stage_id: stage.id().to_string(),
            stage_name: stage.name().to_string(),
            mode: stage.mode(),
            timeout_s,
            tolerant: stage.is_tolerant(),
        }
    }

    /// Flattens into dotted keys for exporters.
    #[must_use]
    pub fn to_fields(&self) -> BTreeMap<&'static str, String> {
        BTreeMap::from([
            ("stage.id", self.stage_id.clone()),
            ("stage.name", self.stage_name.clone()),
            ("stage.mode", self.mode.to_string()),
            ("stage.timeout_s", self.timeout_s.to_string()),
            ("stage.tolerant", self.tolerant.to_string()),
        ])
    }

    /// Opens the `stage` span.
    #[must_use]
    pub fn span(&self) -> Span {
        info_span!(
            "stage",
            stage_id = %self.stage_id,
            stage_name = %self.stage_name,
            mode = %self.mode,
            timeout_s = self.timeout_s,
            tolerant = self.tolerant,
        )
    }
}

/// Timer for a span, on the runtime clock.
#[derive(Debug)]
pub struct SpanTimer {
    start: Instant,
}

impl SpanTimer {
    /// Starts timing now.
    #[must_use]
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Milliseconds since start.
    #[must_use]
    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_run_fields() {
        let attrs = RunSpanAttributes::new(Uuid::nil(), RuntimeMode::Relaxed, 3);
        let fields = attrs.to_fields();
        assert_eq!(fields["run.runtime_mode"], "relaxed");
        assert_eq!(fields["run.stages_total"], "3");
    }

    #[test]
    fn test_stage_fields() {
        let stage = StageDescriptor::blocking("grid", "Grid", |_| Ok(json!(null)))
            .tolerant();
        let attrs = StageSpanAttributes::for_stage(&stage, 120.0);
        let fields = attrs.to_fields();
        assert_eq!(fields["stage.id"], "grid");
        assert_eq!(fields["stage.mode"], "blocking");
        assert_eq!(fields["stage.timeout_s"], "120");
        assert_eq!(fields["stage.tolerant"], "true");
        let _entered = attrs.span().entered();
    }

    #[test]
    fn test_span_timer() {
        let timer = SpanTimer::start();
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(timer.elapsed_ms() >= 5.0);
    }
}
