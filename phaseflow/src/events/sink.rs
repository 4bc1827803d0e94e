//! Event sink trait and implementations.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info, warn, Level};

/// Lifecycle events of a run and its stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// The run began.
    #[serde(rename = "run.started")]
    RunStarted,
    /// A stage began executing.
    #[serde(rename = "stage.started")]
    StageStarted,
    /// A stage finished cleanly.
    #[serde(rename = "stage.completed")]
    StageCompleted,
    /// A tolerant stage finished with accepted sub-item failures.
    #[serde(rename = "stage.degraded")]
    StageDegraded,
    /// A stage failed.
    #[serde(rename = "stage.failed")]
    StageFailed,
    /// A stage crossed the warning threshold of its timeout.
    #[serde(rename = "stage.timeout_warning")]
    StageTimeoutWarning,
    /// A stage exceeded its timeout.
    #[serde(rename = "stage.timeout")]
    StageTimeout,
    /// A stage observed the abort signal while running.
    #[serde(rename = "stage.aborted")]
    StageAborted,
    /// A stage was not started because the run was aborted.
    #[serde(rename = "stage.skipped")]
    StageSkipped,
    /// The run was aborted.
    #[serde(rename = "run.aborted")]
    RunAborted,
    /// The run finished and the manifest was built.
    #[serde(rename = "run.completed")]
    RunCompleted,
}

impl EventKind {
    /// Returns the dotted event name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RunStarted => "run.started",
            Self::StageStarted => "stage.started",
            Self::StageCompleted => "stage.completed",
            Self::StageDegraded => "stage.degraded",
            Self::StageFailed => "stage.failed",
            Self::StageTimeoutWarning => "stage.timeout_warning",
            Self::StageTimeout => "stage.timeout",
            Self::StageAborted => "stage.aborted",
            Self::StageSkipped => "stage.skipped",
            Self::RunAborted => "run.aborted",
            Self::RunCompleted => "run.completed",
        }
    }

    /// Returns true for events that indicate something went wrong.
    #[must_use]
    pub fn is_problem(self) -> bool {
        matches!(
            self,
            Self::StageFailed
                | Self::StageTimeoutWarning
                | Self::StageTimeout
                | Self::StageAborted
                | Self::RunAborted
        )
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receives lifecycle events.
///
/// Emission must never fail or block the run; implementations swallow
/// their own errors.
pub trait EventSink: Send + Sync {
    /// Emits an event.
    fn emit(&self, kind: EventKind, data: serde_json::Value);
}

/// Discards all events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

impl EventSink for NoOpEventSink {
    fn emit(&self, _kind: EventKind, _data: serde_json::Value) {}
}

/// Logs events through `tracing`.
///
/// Problem events are always logged at warn level.
#[derive(Debug, Clone)]
pub struct LoggingEventSink {
    level: Level,
}

impl Default for LoggingEventSink {
    fn default() -> Self {
        Self { level: Level::INFO }
    }
}

impl LoggingEventSink {
    /// Creates a logging sink with the given level for routine events.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    /// Creates a debug-level logging sink.
    #[must_use]
    pub fn debug() -> Self {
        Self::new(Level::DEBUG)
    }
}

impl EventSink for LoggingEventSink {
    fn emit(&self, kind: EventKind, data: serde_json::Value) {
        if kind.is_problem() {
            warn!(event_type = %kind, event_data = %data, "Event: {}", kind);
        } else if self.level == Level::DEBUG {
            debug!(event_type = %kind, event_data = %data, "Event: {}", kind);
        } else {
            info!(event_type = %kind, event_data = %data, "Event: {}", kind);
        }
    }
}

/// Stores events in memory, for tests and post-run inspection.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: RwLock<Vec<(EventKind, serde_json::Value)>>,
}

impl CollectingEventSink {
    /// Creates an empty collecting sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all collected events in emission order.
    #[must_use]
    pub fn events(&self) -> Vec<(EventKind, serde_json::Value)> {
        self.events.read().clone()
    }

    /// Returns the collected event kinds in emission order.
    #[must_use]
    pub fn kinds(&self) -> Vec<EventKind> {
        self.events.read().iter().map(|(k, _)| *k).collect()
    }

    /// Returns the payloads of events of `kind`.
    #[must_use]
    pub fn of_kind(&self, kind: EventKind) -> Vec<serde_json::Value> {
        self.events
            .read()
            .iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, d)| d.clone())
            .collect()
    }

    /// Returns the number of collected events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true if no events have been collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }
}

impl EventSink for CollectingEventSink {
    fn emit(&self, kind: EventKind, data: serde_json::Value) {
        self.events.write().push((kind, data));
    }
}
