//! Immutable stage definitions.

use super::{ExecutionMode, StageContext, StageHandler};
use crate::config::ToleranceDefaults;
use crate::errors::{HandlerError, PipelineValidationError};
use crate::tolerance::TolerancePolicy;
use std::fmt;
use std::future::Future;

/// Where a tolerant stage takes its thresholds from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StageTolerance {
    /// The orchestrator config's tolerance defaults.
    Configured,
    /// A policy fixed on the descriptor.
    Custom(TolerancePolicy),
}

/// One stage of the fixed, linear stage list.
#[derive(Clone)]
pub struct StageDescriptor {
    id: String,
    name: String,
    handler: StageHandler,
    expected_items: u64,
    base_timeout_s: Option<f64>,
    output_name: String,
    tolerance: Option<StageTolerance>,
}

impl fmt::Debug for StageDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageDescriptor")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("mode", &self.mode())
            .field("expected_items", &self.expected_items)
            .field("base_timeout_s", &self.base_timeout_s)
            .field("output_name", &self.output_name)
            .field("tolerance", &self.tolerance)
            .finish()
    }
}

impl StageDescriptor {
    /// Creates a descriptor. The output name defaults to the stage id.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>, handler: StageHandler) -> Self {
        let id = id.into();
        Self {
            output_name: id.clone(),
            id,
            name: name.into(),
            handler,
            expected_items: 0,
            base_timeout_s: None,
            tolerance: None,
        }
    }

    /// Creates a blocking stage from a closure.
    pub fn blocking<F>(id: impl Into<String>, name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&StageContext) -> Result<serde_json::Value, HandlerError> + Send + Sync + 'static,
    {
        Self::new(id, name, StageHandler::blocking(func))
    }

    /// Creates a cooperative stage from an async closure.
    pub fn cooperative<F, Fut>(id: impl Into<String>, name: impl Into<String>, func: F) -> Self
    where
        F: Fn(StageContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value, HandlerError>> + Send + 'static,
    {
        Self::new(id, name, StageHandler::cooperative(func))
    }

    /// Sets the expected number of sub-items.
    #[must_use]
    pub fn with_expected_items(mut self, count: u64) -> Self {
        self.expected_items = count;
        self
    }

    /// Sets the base timeout used when the config table has no entry.
    #[must_use]
    pub fn with_timeout(mut self, seconds: f64) -> Self {
        self.base_timeout_s = Some(seconds);
        self
    }

    /// Sets the name under which later stages see this stage's output.
    #[must_use]
    pub fn with_output_name(mut self, name: impl Into<String>) -> Self {
        self.output_name = name.into();
        self
    }

    /// Tallies sub-item failures using the config's tolerance defaults.
    #[must_use]
    pub fn tolerant(mut self) -> Self {
        self.tolerance = Some(StageTolerance::Configured);
        self
    }

    /// Tallies sub-item failures against a stage-specific policy.
    #[must_use]
    pub fn with_tolerance(mut self, policy: TolerancePolicy) -> Self {
        self.tolerance = Some(StageTolerance::Custom(policy));
        self
    }

    /// Returns the stage id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the stage name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the handler.
    #[must_use]
    pub fn handler(&self) -> &StageHandler {
        &self.handler
    }

    /// Returns the execution mode.
    #[must_use]
    pub fn mode(&self) -> ExecutionMode {
        self.handler.mode()
    }

    /// Returns the expected number of sub-items.
    #[must_use]
    pub fn expected_items(&self) -> u64 {
        self.expected_items
    }

    /// Returns the descriptor's base timeout, if set.
    #[must_use]
    pub fn base_timeout_s(&self) -> Option<f64> {
        self.base_timeout_s
    }

    /// Returns the output name.
    #[must_use]
    pub fn output_name(&self) -> &str {
        &self.output_name
    }

    /// Returns the tolerance setting, if any.
    #[must_use]
    pub fn tolerance(&self) -> Option<StageTolerance> {
        self.tolerance
    }

    /// Returns true if the stage tallies sub-item failures.
    #[must_use]
    pub fn is_tolerant(&self) -> bool {
        self.tolerance.is_some()
    }

    /// Resolves the effective policy against the config's defaults.
    #[must_use]
    pub fn resolve_tolerance(&self, defaults: ToleranceDefaults) -> Option<TolerancePolicy> {
        self.tolerance.map(|tolerance| match tolerance {
            StageTolerance::Configured => defaults.into(),
            StageTolerance::Custom(policy) => policy,
        })
    }

    /// Validates the descriptor in isolation.
    ///
    /// # Errors
    ///
    /// Returns an error for empty identifiers or out-of-range values.
    pub fn validate(&self) -> Result<(), PipelineValidationError> {
        let invalid = |message: String| -> Result<(), PipelineValidationError> {
            Err(PipelineValidationError::new(message).with_stages(vec![self.id.clone()]))
        };

        if self.id.trim().is_empty() {
            return invalid("Stage id cannot be empty".to_string());
        }
        if self.name.trim().is_empty() {
            return invalid(format!("Stage '{}' has an empty name", self.id));
        }
        if self.output_name.trim().is_empty() {
            return invalid(format!("Stage '{}' has an empty output name", self.id));
        }
        if let Some(t) = self.base_timeout_s {
            if !t.is_finite() || t <= 0.0 {
                return invalid(format!("Stage '{}' has non-positive timeout {t}", self.id));
            }
        }
        if let Some(StageTolerance::Custom(policy)) = self.tolerance {
            let rates = [policy.max_failure_rate, policy.min_success_ratio];
            if rates.iter().any(|r| !(0.0..=1.0).contains(r)) {
                return invalid(format!(
                    "Stage '{}' has a tolerance rate outside [0, 1]",
                    self.id
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn noop(id: &str) -> StageDescriptor {
        StageDescriptor::blocking(id, "Noop", |_| Ok(json!(null)))
    }

    #[test]
    fn test_defaults() {
        let stage = noop("ingest");
        assert_eq!(stage.output_name(), "ingest");
        assert_eq!(stage.mode(), ExecutionMode::Blocking);
        assert_eq!(stage.expected_items(), 0);
        assert!(stage.base_timeout_s().is_none());
        assert!(stage.tolerance().is_none());
    }

    #[test]
    fn test_builder_methods() {
        let stage = StageDescriptor::cooperative("cells", "Cells", |_| async { Ok::<_, HandlerError>(json!([])) })
            .with_expected_items(100)
            .with_timeout(30.0)
            .with_output_name("cell_scores")
            .with_tolerance(TolerancePolicy::default());
        assert_eq!(stage.mode(), ExecutionMode::Cooperative);
        assert_eq!(stage.expected_items(), 100);
        assert_eq!(stage.base_timeout_s(), Some(30.0));
        assert_eq!(stage.output_name(), "cell_scores");
        assert!(stage.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(noop("").validate().is_err());
        assert!(noop("a").with_timeout(0.0).validate().is_err());
        assert!(noop("a").with_timeout(f64::NAN).validate().is_err());
        assert!(noop("a").with_output_name(" ").validate().is_err());
        assert!(noop("a")
            .with_tolerance(TolerancePolicy::with_max_failure_rate(1.5))
            .validate()
            .is_err());

        assert!(noop("a").tolerant().validate().is_ok());

        let err = StageDescriptor::blocking("x", "", |_| Ok(json!(null)))
            .validate()
            .unwrap_err();
        assert_eq!(err.stages, vec!["x".to_string()]);
    }

    #[test]
    fn test_configured_tolerance_follows_defaults() {
        let defaults = ToleranceDefaults {
            max_failure_rate: 0.01,
            min_success_ratio: 0.99,
        };
        let policy = noop("grid").tolerant().resolve_tolerance(defaults).unwrap();
        assert_eq!(policy.max_failure_rate, 0.01);
        assert_eq!(policy.min_success_ratio, 0.99);

        let custom = TolerancePolicy::with_max_failure_rate(0.3);
        let stage = noop("grid").with_tolerance(custom);
        assert_eq!(stage.resolve_tolerance(defaults), Some(custom));
        assert_eq!(stage.tolerance(), Some(StageTolerance::Custom(custom)));
        assert!(noop("grid").resolve_tolerance(defaults).is_none());
    }
}
