//! On-demand export of every stage's instrumentation.

use super::{PhaseInstrumentation, PhaseMetrics};
use crate::config::InstrumentationConfig;
use crate::resources::ResourceMonitor;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Concurrent map from stage id to its instrumentation.
///
/// Queryable during or after a run.
#[derive(Debug)]
pub struct MetricsRegistry {
    config: InstrumentationConfig,
    monitor: Option<Arc<ResourceMonitor>>,
    phases: DashMap<String, Arc<PhaseInstrumentation>>,
}

impl MetricsRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new(config: InstrumentationConfig, monitor: Option<Arc<ResourceMonitor>>) -> Self {
        Self {
            config,
            monitor,
            phases: DashMap::new(),
        }
    }

    /// Returns the instrumentation for `stage_id`, creating it if absent.
    pub fn register(&self, stage_id: &str) -> Arc<PhaseInstrumentation> {
        self.phases
            .entry(stage_id.to_string())
            .or_insert_with(|| {
                Arc::new(PhaseInstrumentation::new(
                    stage_id,
                    self.config.clone(),
                    self.monitor.clone(),
                ))
            })
            .clone()
    }

    /// Returns the instrumentation for `stage_id`.
    #[must_use]
    pub fn get(&self, stage_id: &str) -> Option<Arc<PhaseInstrumentation>> {
        self.phases.get(stage_id).map(|p| Arc::clone(p.value()))
    }

    /// Exports every stage's metrics, ordered by stage id.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, PhaseMetrics> {
        self.phases
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().build_metrics()))
            .collect()
    }

    /// Exports every stage's metrics as JSON.
    #[must_use]
    pub fn snapshot_json(&self) -> serde_json::Value {
        serde_json::to_value(self.snapshot()).unwrap_or(serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_register_returns_same_instance() {
        let registry = MetricsRegistry::new(InstrumentationConfig::default(), None);
        let a = registry.register("ingest");
        let b = registry.register("ingest");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_snapshot_is_live() {
        let registry = MetricsRegistry::new(InstrumentationConfig::default(), None);
        let phase = registry.register("score");
        phase.start(10);
        phase.increment(4, Duration::from_millis(8));

        let snapshot = registry.snapshot();
        assert_eq!(snapshot["score"].items_done, 4);

        phase.increment(1, Duration::from_millis(2));
        assert_eq!(registry.snapshot()["score"].items_done, 5);

        let json = registry.snapshot_json();
        assert_eq!(json["score"]["items_total"], serde_json::json!(10));
    }
}
