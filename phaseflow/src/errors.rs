//! Error types for the phaseflow orchestration engine.
//!
//! Genuine faults are modelled as error values. Observing an abort at a
//! stage boundary is not an error: the orchestrator checks the
//! [`AbortSignal`](crate::cancellation::AbortSignal) proactively and records
//! the stage as not started instead.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Result alias for library operations.
pub type Result<T> = std::result::Result<T, PhaseflowError>;

/// The main error type for phaseflow operations.
#[derive(Debug, Error)]
pub enum PhaseflowError {
    /// The pipeline definition is invalid.
    #[error("{0}")]
    Validation(#[from] PipelineValidationError),

    /// The configuration is invalid.
    #[error("{0}")]
    Config(#[from] ConfigError),

    /// A stage exceeded its deadline.
    #[error("{0}")]
    Timeout(#[from] StageTimeoutError),

    /// A stage handler failed.
    #[error("{0}")]
    Handler(#[from] HandlerError),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Error raised when an orchestrator definition fails validation.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct PipelineValidationError {
    /// The error message.
    pub message: String,
    /// The stages involved in the error.
    pub stages: Vec<String>,
}

impl PipelineValidationError {
    /// Creates a new pipeline validation error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stages: Vec::new(),
        }
    }

    /// Sets the stages involved.
    #[must_use]
    pub fn with_stages(mut self, stages: Vec<String>) -> Self {
        self.stages = stages;
        self
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("message".to_string(), serde_json::Value::String(self.message.clone()));
        map.insert("stages".to_string(), serde_json::json!(self.stages));
        map
    }
}

/// Error raised when configuration values are out of range.
#[derive(Debug, Clone, Error)]
#[error("Invalid configuration for '{field}': {reason}")]
pub struct ConfigError {
    /// The offending field.
    pub field: String,
    /// Why the value was rejected.
    pub reason: String,
}

impl ConfigError {
    /// Creates a new configuration error.
    #[must_use]
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// A stage did not complete before its deadline.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("Stage '{stage_name}' ({stage_id}) timed out after {elapsed_s:.3}s (limit {timeout_s:.3}s)")]
pub struct StageTimeoutError {
    /// Stage identifier.
    pub stage_id: String,
    /// Human-readable stage name.
    pub stage_name: String,
    /// Effective timeout that was applied.
    pub timeout_s: f64,
    /// Time elapsed when the deadline fired.
    pub elapsed_s: f64,
    /// Last partial result the handler published, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partial_result: Option<serde_json::Value>,
}

/// Errors raised by stage handlers and their sub-items.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The handler observed the run-wide abort signal mid-execution.
    #[error("Aborted: {reason}")]
    Aborted {
        /// The abort reason.
        reason: String,
    },

    /// The handler observed its stage-local cancellation token.
    #[error("Cancelled: {reason}")]
    Cancelled {
        /// The cancellation reason.
        reason: String,
    },

    /// A required prior stage output was absent.
    #[error("Missing input '{name}'")]
    MissingInput {
        /// Declared output name that was requested.
        name: String,
    },

    /// Offloaded work panicked or could not be joined.
    #[error("Handler panicked: {0}")]
    Panicked(String),

    /// Any other failure raised by handler code.
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl HandlerError {
    /// Creates a generic failure from a message.
    #[must_use]
    pub fn failed(message: impl std::fmt::Display) -> Self {
        Self::Failed(anyhow::anyhow!("{message}"))
    }

    /// Returns true if this error stems from abort or cancellation.
    #[must_use]
    pub fn is_interruption(&self) -> bool {
        matches!(self, Self::Aborted { .. } | Self::Cancelled { .. })
    }

    /// Returns a short machine-readable category.
    #[must_use]
    pub fn category(&self) -> &'static str {
        match self {
            Self::Aborted { .. } => "aborted",
            Self::Cancelled { .. } => "cancelled",
            Self::MissingInput { .. } => "missing_input",
            Self::Panicked(_) => "panicked",
            Self::Failed(_) => "failed",
        }
    }
}
