//! Per-stage success/failure tallies and success classification.

use crate::config::{RuntimeMode, ToleranceDefaults};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Thresholds applied to a tolerant stage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TolerancePolicy {
    /// Maximum failure rate accepted in strict mode.
    pub max_failure_rate: f64,
    /// Minimum fraction of `total` that must succeed in non-strict modes.
    pub min_success_ratio: f64,
}

impl Default for TolerancePolicy {
    fn default() -> Self {
        ToleranceDefaults::default().into()
    }
}

impl From<ToleranceDefaults> for TolerancePolicy {
    fn from(d: ToleranceDefaults) -> Self {
        Self {
            max_failure_rate: d.max_failure_rate,
            min_success_ratio: d.min_success_ratio,
        }
    }
}

impl TolerancePolicy {
    /// Creates a policy with the given maximum failure rate.
    #[must_use]
    pub fn with_max_failure_rate(max_failure_rate: f64) -> Self {
        Self {
            max_failure_rate,
            ..Self::default()
        }
    }
}

/// Snapshot of a tracker's counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorToleranceState {
    /// Stage id.
    pub stage_id: String,
    /// Expected number of sub-items.
    pub total: u64,
    /// Sub-items that succeeded.
    pub succeeded: u64,
    /// Sub-items that failed.
    pub failed: u64,
    /// Maximum failure rate of the policy.
    pub max_failure_rate: f64,
}

impl ErrorToleranceState {
    /// Returns `failed / (succeeded + failed)`, or 0 when nothing is recorded.
    #[must_use]
    pub fn failure_rate(&self) -> f64 {
        failure_rate(self.succeeded, self.failed)
    }
}

#[derive(Debug, Default)]
struct Counts {
    total: u64,
    succeeded: u64,
    failed: u64,
    sealed: bool,
}

/// Tallies sub-item outcomes for one high-cardinality stage.
///
/// Invariant: `succeeded + failed <= total`; counters never decrease.
#[derive(Debug)]
pub struct ErrorToleranceTracker {
    stage_id: String,
    policy: TolerancePolicy,
    counts: Mutex<Counts>,
}

impl ErrorToleranceTracker {
    /// Creates a tracker expecting `total` sub-items.
    #[must_use]
    pub fn new(stage_id: impl Into<String>, total: u64, policy: TolerancePolicy) -> Self {
        Self {
            stage_id: stage_id.into(),
            policy,
            counts: Mutex::new(Counts {
                total,
                ..Counts::default()
            }),
        }
    }

    /// Returns the stage id.
    #[must_use]
    pub fn stage_id(&self) -> &str {
        &self.stage_id
    }

    /// Returns the policy.
    #[must_use]
    pub fn policy(&self) -> TolerancePolicy {
        self.policy
    }

    /// Makes room for `additional` more outcomes on top of those already
    /// recorded, raising `total` when needed. Never lowers it.
    pub fn reserve(&self, additional: u64) {
        let mut counts = self.counts.lock();
        let needed = counts.succeeded + counts.failed + additional;
        counts.total = counts.total.max(needed);
    }

    /// Freezes the tallies. Outcomes recorded afterwards are dropped.
    pub fn seal(&self) {
        self.counts.lock().sealed = true;
    }

    /// Returns true once [`seal`](Self::seal) has been called.
    #[must_use]
    pub fn is_sealed(&self) -> bool {
        self.counts.lock().sealed
    }

    /// Records a successful sub-item. Returns false if `total` is exhausted.
    pub fn record_success(&self) -> bool {
        self.record(true)
    }

    /// Records a failed sub-item. Returns false if `total` is exhausted.
    pub fn record_failure(&self) -> bool {
        self.record(false)
    }

    fn record(&self, success: bool) -> bool {
        let mut counts = self.counts.lock();
        if counts.sealed {
            debug!(stage_id = %self.stage_id, "Ignoring sub-item outcome after seal");
            return false;
        }
        if counts.succeeded + counts.failed >= counts.total {
            warn!(
                stage_id = %self.stage_id,
                total = counts.total,
                "Ignoring sub-item outcome beyond expected total"
            );
            return false;
        }
        if success {
            counts.succeeded += 1;
        } else {
            counts.failed += 1;
        }
        true
    }

    /// Returns `failed / (succeeded + failed)`, or 0 when nothing is recorded.
    #[must_use]
    pub fn current_failure_rate(&self) -> f64 {
        let counts = self.counts.lock();
        failure_rate(counts.succeeded, counts.failed)
    }

    /// Returns true when the failure rate is above the policy maximum.
    #[must_use]
    pub fn threshold_exceeded(&self) -> bool {
        self.current_failure_rate() > self.policy.max_failure_rate
    }

    /// Decides whether the stage may be reported successful.
    ///
    /// Strict mode requires the failure rate to stay within the maximum.
    /// Relaxed and exploratory modes require `succeeded >= min_success_ratio * total`.
    #[must_use]
    pub fn can_mark_success(&self, mode: RuntimeMode) -> bool {
        let counts = self.counts.lock();
        if mode.is_strict() {
            failure_rate(counts.succeeded, counts.failed) <= self.policy.max_failure_rate
        } else {
            counts.succeeded as f64 >= self.policy.min_success_ratio * counts.total as f64
        }
    }

    /// Returns true if any outcome has been recorded.
    #[must_use]
    pub fn has_records(&self) -> bool {
        let counts = self.counts.lock();
        counts.succeeded + counts.failed > 0
    }

    /// Returns a snapshot of the counters.
    #[must_use]
    pub fn state(&self) -> ErrorToleranceState {
        let counts = self.counts.lock();
        ErrorToleranceState {
            stage_id: self.stage_id.clone(),
            total: counts.total,
            succeeded: counts.succeeded,
            failed: counts.failed,
            max_failure_rate: self.policy.max_failure_rate,
        }
    }
}

#[allow(clippy::cast_precision_loss)]
fn failure_rate(succeeded: u64, failed: u64) -> f64 {
    let attempted = succeeded + failed;
    if attempted == 0 {
        0.0
    } else {
        failed as f64 / attempted as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn tracker_with(total: u64, succeeded: u64, failed: u64) -> ErrorToleranceTracker {
        let tracker = ErrorToleranceTracker::new("cells", total, TolerancePolicy::default());
        for _ in 0..succeeded {
            tracker.record_success();
        }
        for _ in 0..failed {
            tracker.record_failure();
        }
        tracker
    }

    #[test]
    fn test_default_policy() {
        let policy = TolerancePolicy::default();
        assert_eq!(policy.max_failure_rate, 0.10);
        assert_eq!(policy.min_success_ratio, 0.5);
    }

    #[test]
    fn test_failure_rate_formula() {
        let tracker = tracker_with(10, 3, 1);
        assert!((tracker.current_failure_rate() - 0.25).abs() < f64::EPSILON);
        assert_eq!(tracker_with(10, 0, 0).current_failure_rate(), 0.0);
    }

    #[test]
    fn test_strict_eight_failures_accepted() {
        let tracker = tracker_with(100, 92, 8);
        assert!(!tracker.threshold_exceeded());
        assert!(tracker.can_mark_success(RuntimeMode::Strict));
    }

    #[test]
    fn test_strict_fifteen_failures_rejected() {
        let tracker = tracker_with(100, 85, 15);
        assert!(tracker.threshold_exceeded());
        assert!(!tracker.can_mark_success(RuntimeMode::Strict));
    }

    #[test]
    fn test_relaxed_forty_failures_accepted() {
        let tracker = tracker_with(100, 60, 40);
        assert!(tracker.can_mark_success(RuntimeMode::Relaxed));
        assert!(tracker.can_mark_success(RuntimeMode::Exploratory));
    }

    #[test]
    fn test_relaxed_sixty_failures_rejected() {
        let tracker = tracker_with(100, 40, 60);
        assert!(!tracker.can_mark_success(RuntimeMode::Relaxed));
    }

    #[test]
    fn test_relaxed_measures_against_total_not_attempted() {
        // only 30 of 100 attempted, all succeeded
        let tracker = tracker_with(100, 30, 0);
        assert!(tracker.can_mark_success(RuntimeMode::Strict));
        assert!(!tracker.can_mark_success(RuntimeMode::Relaxed));
    }

    #[test]
    fn test_records_beyond_total_rejected() {
        let tracker = tracker_with(2, 2, 0);
        assert!(!tracker.record_failure());

        let state = tracker.state();
        assert_eq!(state.succeeded + state.failed, 2);
        assert_eq!(state.failed, 0);
    }

    #[test]
    fn test_reserve_never_lowers() {
        let tracker = tracker_with(5, 0, 0);
        tracker.reserve(10);
        tracker.reserve(3);
        assert_eq!(tracker.state().total, 10);
    }

    #[test]
    fn test_reserve_counts_from_recorded_outcomes() {
        let tracker = tracker_with(0, 0, 0);
        tracker.reserve(10);
        for _ in 0..10 {
            assert!(tracker.record_success());
        }
        tracker.reserve(10);
        for i in 0..10 {
            if i % 2 == 0 {
                assert!(tracker.record_failure());
            } else {
                assert!(tracker.record_success());
            }
        }

        let state = tracker.state();
        assert_eq!(state.total, 20);
        assert_eq!(state.succeeded, 15);
        assert_eq!(state.failed, 5);
    }

    #[test]
    fn test_sealed_tracker_drops_outcomes() {
        let tracker = tracker_with(10, 3, 1);
        tracker.seal();
        assert!(tracker.is_sealed());
        assert!(!tracker.record_success());
        assert!(!tracker.record_failure());

        let state = tracker.state();
        assert_eq!(state.succeeded, 3);
        assert_eq!(state.failed, 1);
    }

    #[test]
    fn test_failure_rate_non_decreasing_under_failures() {
        let tracker = tracker_with(100, 10, 0);
        let mut last = tracker.current_failure_rate();
        for _ in 0..20 {
            tracker.record_failure();
            let rate = tracker.current_failure_rate();
            assert!(rate >= last);
            last = rate;
        }
    }

    #[test]
    fn test_concurrent_records_preserve_invariant() {
        let tracker = Arc::new(ErrorToleranceTracker::new(
            "grid",
            500,
            TolerancePolicy::default(),
        ));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let t = tracker.clone();
                std::thread::spawn(move || {
                    for j in 0..100 {
                        if (i + j) % 10 == 0 {
                            t.record_failure();
                        } else {
                            t.record_success();
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let state = tracker.state();
        assert_eq!(state.succeeded + state.failed, 500);
        assert!((state.failure_rate() - tracker.current_failure_rate()).abs() < f64::EPSILON);
    }
}
