//! Adaptive worker sizing for cooperative fan-out.

use super::monitor::{ResourceMonitor, ResourceSnapshot};
use crate::config::ResourceLimits;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Computes a bounded worker count from resource pressure and backlog.
///
/// The count halves while memory or CPU exceed their thresholds, doubles
/// (up to `max_workers`) while both sit below `headroom_ratio` of their
/// thresholds and the backlog is larger than the current count, and is
/// always clamped to `[min_workers, hard_max_workers]`.
#[derive(Debug)]
pub struct AdaptiveWorkerPool {
    limits: ResourceLimits,
    monitor: Arc<ResourceMonitor>,
    current: AtomicUsize,
}

impl AdaptiveWorkerPool {
    /// Creates a pool starting at half of `max_workers` (at least `min_workers`).
    #[must_use]
    pub fn new(limits: ResourceLimits, monitor: Arc<ResourceMonitor>) -> Self {
        let initial = (limits.max_workers / 2)
            .max(limits.min_workers)
            .min(limits.hard_max_workers.max(1));
        monitor.set_worker_count(initial);
        Self {
            limits,
            monitor,
            current: AtomicUsize::new(initial),
        }
    }

    /// Returns the monitor backing this pool.
    #[must_use]
    pub fn monitor(&self) -> &Arc<ResourceMonitor> {
        &self.monitor
    }

    /// Returns the limits in effect.
    #[must_use]
    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    /// Returns the last computed worker count.
    #[must_use]
    pub fn current_workers(&self) -> usize {
        self.current.load(Ordering::Relaxed)
    }

    /// Samples resources and returns the worker count for `backlog` pending items.
    pub fn compute_target_workers(&self, backlog: usize) -> usize {
        let snapshot = self.monitor.sample();
        self.target_for(&snapshot, backlog)
    }

    /// Computes the worker count against a given snapshot.
    pub fn target_for(&self, snapshot: &ResourceSnapshot, backlog: usize) -> usize {
        let l = &self.limits;
        let current = self.current.load(Ordering::Relaxed);

        let over_limit =
            snapshot.memory_mb > l.max_memory_mb || snapshot.cpu_percent > l.max_cpu_percent;
        let has_headroom = snapshot.memory_mb < l.max_memory_mb * l.headroom_ratio
            && snapshot.cpu_percent < l.max_cpu_percent * l.headroom_ratio;

        let proposed = if over_limit {
            current / 2
        } else if has_headroom && backlog > current {
            current.saturating_mul(2).min(l.max_workers)
        } else {
            current
        };

        let floor = l.min_workers.max(1);
        let ceiling = l.hard_max_workers.max(floor);
        let target = proposed.clamp(floor, ceiling);

        if target != current {
            debug!(
                from = current,
                to = target,
                memory_mb = snapshot.memory_mb,
                cpu_percent = snapshot.cpu_percent,
                backlog,
                "Adjusting worker count"
            );
            self.current.store(target, Ordering::Relaxed);
            self.monitor.set_worker_count(target);
        }
        target
    }
}
