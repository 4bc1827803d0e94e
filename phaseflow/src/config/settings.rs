//! Orchestrator configuration types.

use super::RuntimeMode;
use crate::errors::{ConfigError, PhaseflowError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Base timeouts per stage id, in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeoutTable {
    /// Stage id to base timeout in seconds.
    #[serde(default)]
    pub base: BTreeMap<String, f64>,
    /// Fallback when neither the table nor the descriptor names a timeout.
    #[serde(default = "default_timeout_s")]
    pub default_timeout_s: f64,
}

fn default_timeout_s() -> f64 {
    300.0
}

impl Default for TimeoutTable {
    fn default() -> Self {
        Self {
            base: BTreeMap::new(),
            default_timeout_s: default_timeout_s(),
        }
    }
}

impl TimeoutTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a stage's base timeout.
    #[must_use]
    pub fn with_stage(mut self, stage_id: impl Into<String>, seconds: f64) -> Self {
        self.base.insert(stage_id.into(), seconds);
        self
    }

    /// Returns the configured base timeout for a stage, if any.
    #[must_use]
    pub fn get(&self, stage_id: &str) -> Option<f64> {
        self.base.get(stage_id).copied()
    }
}

/// Limits used by the resource monitor and adaptive worker pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Resident memory above which the pool shrinks.
    #[serde(default = "default_max_memory_mb")]
    pub max_memory_mb: f64,
    /// CPU usage above which the pool shrinks.
    #[serde(default = "default_max_cpu_percent")]
    pub max_cpu_percent: f64,
    /// Lower bound for the worker count.
    #[serde(default = "default_min_workers")]
    pub min_workers: usize,
    /// Soft ceiling the pool grows towards under headroom.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Absolute ceiling, never exceeded regardless of backlog.
    #[serde(default = "default_hard_max_workers")]
    pub hard_max_workers: usize,
    /// Number of snapshots retained in the rolling history.
    #[serde(default = "default_history_len")]
    pub history_len: usize,
    /// Background sampling interval in milliseconds.
    #[serde(default = "default_sample_interval_ms")]
    pub sample_interval_ms: u64,
    /// Fraction of a limit below which there is headroom to grow.
    #[serde(default = "default_headroom_ratio")]
    pub headroom_ratio: f64,
}

fn default_max_memory_mb() -> f64 {
    4096.0
}

fn default_max_cpu_percent() -> f64 {
    85.0
}

fn default_min_workers() -> usize {
    1
}

fn default_max_workers() -> usize {
    8
}

fn default_hard_max_workers() -> usize {
    32
}

fn default_history_len() -> usize {
    120
}

fn default_sample_interval_ms() -> u64 {
    1000
}

fn default_headroom_ratio() -> f64 {
    0.7
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_memory_mb: default_max_memory_mb(),
            max_cpu_percent: default_max_cpu_percent(),
            min_workers: default_min_workers(),
            max_workers: default_max_workers(),
            hard_max_workers: default_hard_max_workers(),
            history_len: default_history_len(),
            sample_interval_ms: default_sample_interval_ms(),
            headroom_ratio: default_headroom_ratio(),
        }
    }
}

impl ResourceLimits {
    /// Sets the worker bounds.
    #[must_use]
    pub fn with_workers(mut self, min: usize, max: usize, hard_max: usize) -> Self {
        self.min_workers = min;
        self.max_workers = max;
        self.hard_max_workers = hard_max;
        self
    }

    /// Sets the memory and CPU thresholds.
    #[must_use]
    pub fn with_thresholds(mut self, max_memory_mb: f64, max_cpu_percent: f64) -> Self {
        self.max_memory_mb = max_memory_mb;
        self.max_cpu_percent = max_cpu_percent;
        self
    }

    /// Sets the rolling history length.
    #[must_use]
    pub fn with_history_len(mut self, len: usize) -> Self {
        self.history_len = len;
        self
    }

    /// Returns the sampling interval as a Duration.
    #[must_use]
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }
}

/// Settings for per-stage instrumentation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrumentationConfig {
    /// Number of latency samples kept for percentile computation.
    #[serde(default = "default_latency_window")]
    pub latency_window: usize,
    /// Take a resource snapshot every this many increments.
    #[serde(default = "default_snapshot_every")]
    pub snapshot_every: u64,
    /// Maximum warnings and errors retained per stage, each.
    #[serde(default = "default_max_events")]
    pub max_events: usize,
}

fn default_latency_window() -> usize {
    1024
}

fn default_snapshot_every() -> u64 {
    50
}

fn default_max_events() -> usize {
    256
}

impl Default for InstrumentationConfig {
    fn default() -> Self {
        Self {
            latency_window: default_latency_window(),
            snapshot_every: default_snapshot_every(),
            max_events: default_max_events(),
        }
    }
}

/// Default error-tolerance thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ToleranceDefaults {
    /// Maximum failure rate accepted in strict mode.
    #[serde(default = "default_max_failure_rate")]
    pub max_failure_rate: f64,
    /// Minimum success ratio accepted in relaxed and exploratory modes.
    #[serde(default = "default_min_success_ratio")]
    pub min_success_ratio: f64,
}

fn default_max_failure_rate() -> f64 {
    0.10
}

fn default_min_success_ratio() -> f64 {
    0.5
}

impl Default for ToleranceDefaults {
    fn default() -> Self {
        Self {
            max_failure_rate: default_max_failure_rate(),
            min_success_ratio: default_min_success_ratio(),
        }
    }
}

/// Top-level orchestrator configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Runtime mode.
    #[serde(default)]
    pub runtime_mode: RuntimeMode,
    /// Base timeout table.
    #[serde(default)]
    pub timeouts: TimeoutTable,
    /// Resource limits.
    #[serde(default)]
    pub resources: ResourceLimits,
    /// Instrumentation settings.
    #[serde(default)]
    pub instrumentation: InstrumentationConfig,
    /// Tolerance defaults.
    #[serde(default)]
    pub tolerance: ToleranceDefaults,
    /// Fraction of the timeout at which a warning is emitted.
    #[serde(default = "default_warning_threshold")]
    pub warning_threshold: f64,
}

fn default_warning_threshold() -> f64 {
    0.8
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            runtime_mode: RuntimeMode::default(),
            timeouts: TimeoutTable::default(),
            resources: ResourceLimits::default(),
            instrumentation: InstrumentationConfig::default(),
            tolerance: ToleranceDefaults::default(),
            warning_threshold: default_warning_threshold(),
        }
    }
}

impl OrchestratorConfig {
    /// Creates a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the runtime mode.
    #[must_use]
    pub fn with_runtime_mode(mut self, mode: RuntimeMode) -> Self {
        self.runtime_mode = mode;
        self
    }

    /// Sets the timeout table.
    #[must_use]
    pub fn with_timeouts(mut self, timeouts: TimeoutTable) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Sets the resource limits.
    #[must_use]
    pub fn with_resources(mut self, resources: ResourceLimits) -> Self {
        self.resources = resources;
        self
    }

    /// Sets the instrumentation settings.
    #[must_use]
    pub fn with_instrumentation(mut self, instrumentation: InstrumentationConfig) -> Self {
        self.instrumentation = instrumentation;
        self
    }

    /// Sets the tolerance defaults.
    #[must_use]
    pub fn with_tolerance(mut self, tolerance: ToleranceDefaults) -> Self {
        self.tolerance = tolerance;
        self
    }

    /// Parses a configuration from JSON.
    pub fn from_json_str(json: &str) -> Result<Self, PhaseflowError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads a configuration from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, PhaseflowError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Checks all values are within range.
    ///
    /// # Errors
    ///
    /// Returns the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let t = &self.timeouts;
        if !(t.default_timeout_s.is_finite() && t.default_timeout_s > 0.0) {
            return Err(ConfigError::new("default_timeout_s", "must be positive"));
        }
        if let Some((id, _)) = t.base.iter().find(|(_, s)| !(s.is_finite() && **s > 0.0)) {
            return Err(ConfigError::new(
                format!("timeouts.base.{id}"),
                "must be positive",
            ));
        }

        let r = &self.resources;
        if r.min_workers == 0 {
            return Err(ConfigError::new("min_workers", "must be at least 1"));
        }
        if r.min_workers > r.max_workers {
            return Err(ConfigError::new("max_workers", "must be >= min_workers"));
        }
        if r.max_workers > r.hard_max_workers {
            return Err(ConfigError::new("hard_max_workers", "must be >= max_workers"));
        }
        if r.history_len == 0 {
            return Err(ConfigError::new("history_len", "must be at least 1"));
        }
        if r.sample_interval_ms == 0 {
            return Err(ConfigError::new("sample_interval_ms", "must be positive"));
        }
        if !(r.max_memory_mb > 0.0 && r.max_cpu_percent > 0.0) {
            return Err(ConfigError::new("resources", "thresholds must be positive"));
        }
        if !(0.0..=1.0).contains(&r.headroom_ratio) {
            return Err(ConfigError::new("headroom_ratio", "must be within [0, 1]"));
        }

        if self.instrumentation.latency_window == 0 {
            return Err(ConfigError::new("latency_window", "must be at least 1"));
        }
        if self.instrumentation.snapshot_every == 0 {
            return Err(ConfigError::new("snapshot_every", "must be at least 1"));
        }

        if !(0.0..=1.0).contains(&self.tolerance.max_failure_rate) {
            return Err(ConfigError::new("max_failure_rate", "must be within [0, 1]"));
        }
        if !(0.0..=1.0).contains(&self.tolerance.min_success_ratio) {
            return Err(ConfigError::new("min_success_ratio", "must be within [0, 1]"));
        }
        if !(self.warning_threshold > 0.0 && self.warning_threshold < 1.0) {
            return Err(ConfigError::new("warning_threshold", "must be within (0, 1)"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults() {
        let config = OrchestratorConfig::new();
        assert_eq!(config.runtime_mode, RuntimeMode::Strict);
        assert_eq!(config.resources.hard_max_workers, 32);
        assert_eq!(config.tolerance.max_failure_rate, 0.10);
        assert_eq!(config.warning_threshold, 0.8);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_json_fills_defaults() {
        let config = OrchestratorConfig::from_json_str(
            r#"{
                "runtime_mode": "development",
                "timeouts": { "base": { "ingest": 30.0 } },
                "resources": { "max_workers": 4 }
            }"#,
        )
        .unwrap();

        assert_eq!(config.runtime_mode, RuntimeMode::Relaxed);
        assert_eq!(config.timeouts.get("ingest"), Some(30.0));
        assert_eq!(config.timeouts.default_timeout_s, 300.0);
        assert_eq!(config.resources.max_workers, 4);
        assert_eq!(config.resources.min_workers, 1);
        assert_eq!(config.instrumentation, InstrumentationConfig::default());
    }

    #[test]
    fn test_validate_rejects_inverted_workers() {
        let config = OrchestratorConfig::new()
            .with_resources(ResourceLimits::default().with_workers(4, 2, 8));
        let err = config.validate().unwrap_err();
        assert_eq!(err.field, "max_workers");
    }

    #[test]
    fn test_validate_rejects_non_positive_timeout() {
        let config = OrchestratorConfig::new()
            .with_timeouts(TimeoutTable::new().with_stage("ingest", 0.0));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_rate() {
        let config = OrchestratorConfig::new().with_tolerance(ToleranceDefaults {
            max_failure_rate: 1.5,
            min_success_ratio: 0.5,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "runtime_mode": "exploratory" }"#).unwrap();

        let config = OrchestratorConfig::from_json_file(&path).unwrap();
        assert_eq!(config.runtime_mode, RuntimeMode::Exploratory);
    }
}
