//! Registry of per-stage tolerance trackers.

use super::{ErrorToleranceState, ErrorToleranceTracker, TolerancePolicy};
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Concurrent map from stage id to its tracker.
#[derive(Debug, Default)]
pub struct ToleranceRegistry {
    trackers: DashMap<String, Arc<ErrorToleranceTracker>>,
}

impl ToleranceRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the tracker for `stage_id`, creating it if absent.
    pub fn register(
        &self,
        stage_id: &str,
        total: u64,
        policy: TolerancePolicy,
    ) -> Arc<ErrorToleranceTracker> {
        self.trackers
            .entry(stage_id.to_string())
            .or_insert_with(|| Arc::new(ErrorToleranceTracker::new(stage_id, total, policy)))
            .clone()
    }

    /// Returns the tracker for `stage_id`.
    #[must_use]
    pub fn get(&self, stage_id: &str) -> Option<Arc<ErrorToleranceTracker>> {
        self.trackers.get(stage_id).map(|t| Arc::clone(t.value()))
    }

    /// Returns every tracker's state, ordered by stage id.
    #[must_use]
    pub fn states(&self) -> BTreeMap<String, ErrorToleranceState> {
        self.trackers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().state()))
            .collect()
    }

    /// Returns the number of registered trackers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.trackers.len()
    }

    /// Returns true when no tracker is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.trackers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_is_idempotent() {
        let registry = ToleranceRegistry::new();
        let a = registry.register("cells", 10, TolerancePolicy::default());
        a.record_failure();

        let b = registry.register("cells", 99, TolerancePolicy::default());
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(b.state().total, 10);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_states_ordered_by_stage() {
        let registry = ToleranceRegistry::new();
        registry.register("zeta", 1, TolerancePolicy::default());
        registry.register("alpha", 1, TolerancePolicy::default());

        let keys: Vec<_> = registry.states().into_keys().collect();
        assert_eq!(keys, vec!["alpha".to_string(), "zeta".to_string()]);
        assert!(registry.get("alpha").is_some());
        assert!(registry.get("missing").is_none());
    }
}
