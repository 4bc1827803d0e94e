//! Progress, throughput and latency tracking for one stage.

use crate::config::InstrumentationConfig;
use crate::resources::{ResourceMonitor, ResourceSnapshot};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A warning or error recorded against a stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentationEvent {
    /// Short machine-readable category (e.g. `timeout_warning`).
    pub category: String,
    /// Structured details.
    pub payload: serde_json::Value,
    /// When it was recorded.
    pub timestamp: DateTime<Utc>,
}

/// Latency percentiles in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct LatencyPercentiles {
    /// Smallest sample.
    pub min_ms: f64,
    /// 50th percentile.
    pub median_ms: f64,
    /// 95th percentile.
    pub p95_ms: f64,
    /// 99th percentile.
    pub p99_ms: f64,
    /// Number of samples the percentiles were computed from.
    pub samples: usize,
}

impl LatencyPercentiles {
    /// Computes nearest-rank percentiles over `samples`.
    #[must_use]
    pub fn from_samples(samples: &[f64]) -> Self {
        if samples.is_empty() {
            return Self::default();
        }
        let mut sorted = samples.to_vec();
        sorted.sort_by(f64::total_cmp);

        Self {
            min_ms: sorted[0],
            median_ms: percentile(&sorted, 50),
            p95_ms: percentile(&sorted, 95),
            p99_ms: percentile(&sorted, 99),
            samples: sorted.len(),
        }
    }
}

/// Computes the `p`-th percentile from a sorted slice.
///
/// Uses nearest-rank method. `p` is clamped to `[0, 100]`.
#[must_use]
pub fn percentile(sorted: &[f64], p: u32) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let p = p.min(100) as usize;
    let n = sorted.len();
    // nearest-rank: index = ceil(p/100 * n) - 1, clamped to valid range.
    let rank = (p * n).div_ceil(100);
    sorted[rank.saturating_sub(1).min(n - 1)]
}

/// Metrics exported for one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseMetrics {
    /// Stage id.
    pub stage_id: String,
    /// Expected number of items.
    pub items_total: u64,
    /// Items completed so far.
    pub items_done: u64,
    /// `items_done / items_total`, clamped to `[0, 1]`.
    pub progress: f64,
    /// Items per second since `start`.
    pub throughput: f64,
    /// Seconds since `start`.
    pub elapsed_s: f64,
    /// Latency percentiles over the sample window.
    pub latency: LatencyPercentiles,
    /// Resource snapshots taken during the stage.
    pub resource_history: Vec<ResourceSnapshot>,
    /// Recorded warnings.
    pub warnings: Vec<InstrumentationEvent>,
    /// Recorded errors.
    pub errors: Vec<InstrumentationEvent>,
}

#[derive(Debug, Default)]
struct Window {
    started: Option<Instant>,
    latencies_ms: VecDeque<f64>,
    resources: VecDeque<ResourceSnapshot>,
    warnings: Vec<InstrumentationEvent>,
    errors: Vec<InstrumentationEvent>,
}

/// Instrumentation for one stage, safe to update from concurrent workers.
#[derive(Debug)]
pub struct PhaseInstrumentation {
    stage_id: String,
    config: InstrumentationConfig,
    monitor: Option<Arc<ResourceMonitor>>,
    items_total: AtomicU64,
    items_done: AtomicU64,
    window: Mutex<Window>,
}

impl PhaseInstrumentation {
    /// Creates instrumentation for a stage.
    #[must_use]
    pub fn new(
        stage_id: impl Into<String>,
        config: InstrumentationConfig,
        monitor: Option<Arc<ResourceMonitor>>,
    ) -> Self {
        Self {
            stage_id: stage_id.into(),
            config,
            monitor,
            items_total: AtomicU64::new(0),
            items_done: AtomicU64::new(0),
            window: Mutex::new(Window::default()),
        }
    }

    /// Returns the stage id.
    #[must_use]
    pub fn stage_id(&self) -> &str {
        &self.stage_id
    }

    /// Marks the stage as started with `items_total` expected items.
    pub fn start(&self, items_total: u64) {
        self.items_total.store(items_total, Ordering::Relaxed);
        let mut window = self.window.lock();
        if window.started.is_none() {
            window.started = Some(Instant::now());
        }
    }

    /// Makes room for `additional` items beyond those already done.
    pub fn reserve(&self, additional: u64) {
        let needed = self.items_done.load(Ordering::Relaxed) + additional;
        self.items_total.fetch_max(needed, Ordering::Relaxed);
    }

    /// Records `count` completed items taking `latency` in aggregate.
    ///
    /// A resource snapshot is taken each time the done counter crosses a
    /// multiple of `snapshot_every`.
    pub fn increment(&self, count: u64, latency: Duration) {
        if count == 0 {
            return;
        }
        let before = self.items_done.fetch_add(count, Ordering::Relaxed);
        let after = before + count;
        let every = self.config.snapshot_every.max(1);
        let crossed = after / every > before / every;

        #[allow(clippy::cast_precision_loss)]
        let per_item_ms = latency.as_secs_f64() * 1000.0 / count as f64;

        let snapshot = if crossed {
            self.monitor.as_ref().map(|m| m.sample())
        } else {
            None
        };

        let mut window = self.window.lock();
        if window.started.is_none() {
            window.started = Some(Instant::now());
        }
        let cap = self.config.latency_window.max(1);
        while window.latencies_ms.len() >= cap {
            window.latencies_ms.pop_front();
        }
        window.latencies_ms.push_back(per_item_ms);

        if let Some(snapshot) = snapshot {
            while window.resources.len() >= self.history_cap() {
                window.resources.pop_front();
            }
            window.resources.push_back(snapshot);
        }
    }

    /// Records a warning.
    pub fn record_warning(&self, category: impl Into<String>, payload: serde_json::Value) {
        let event = self.event(category, payload);
        let cap = self.config.max_events;
        let mut window = self.window.lock();
        if window.warnings.len() < cap {
            window.warnings.push(event);
        }
    }

    /// Records an error.
    pub fn record_error(&self, category: impl Into<String>, payload: serde_json::Value) {
        let event = self.event(category, payload);
        let cap = self.config.max_events;
        let mut window = self.window.lock();
        if window.errors.len() < cap {
            window.errors.push(event);
        }
    }

    /// Returns the number of completed items.
    #[must_use]
    pub fn items_done(&self) -> u64 {
        self.items_done.load(Ordering::Relaxed)
    }

    /// Builds the exported metrics.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn build_metrics(&self) -> PhaseMetrics {
        let items_total = self.items_total.load(Ordering::Relaxed);
        let items_done = self.items_done.load(Ordering::Relaxed);
        let window = self.window.lock();

        let elapsed_s = window.started.map_or(0.0, |s| s.elapsed().as_secs_f64());
        let progress = if items_total == 0 {
            if items_done > 0 { 1.0 } else { 0.0 }
        } else {
            (items_done as f64 / items_total as f64).min(1.0)
        };
        let throughput = if elapsed_s > 0.0 {
            items_done as f64 / elapsed_s
        } else {
            0.0
        };
        let samples: Vec<f64> = window.latencies_ms.iter().copied().collect();

        PhaseMetrics {
            stage_id: self.stage_id.clone(),
            items_total,
            items_done,
            progress,
            throughput,
            elapsed_s,
            latency: LatencyPercentiles::from_samples(&samples),
            resource_history: window.resources.iter().cloned().collect(),
            warnings: window.warnings.clone(),
            errors: window.errors.clone(),
        }
    }

    fn history_cap(&self) -> usize {
        self.monitor.as_ref().map_or(1, |m| m.capacity())
    }

    fn event(&self, category: impl Into<String>, payload: serde_json::Value) -> InstrumentationEvent {
        InstrumentationEvent {
            category: category.into(),
            payload,
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::FixedResourceProbe;
    use pretty_assertions::assert_eq;

    fn config(snapshot_every: u64, latency_window: usize) -> InstrumentationConfig {
        InstrumentationConfig {
            latency_window,
            snapshot_every,
            max_events: 3,
        }
    }

    #[test]
    fn test_percentile_nearest_rank() {
        let sorted: Vec<f64> = (1..=20).map(f64::from).collect();
        assert_eq!(percentile(&sorted, 50), 10.0);
        assert_eq!(percentile(&sorted, 95), 19.0);
        assert_eq!(percentile(&sorted, 99), 20.0);
        assert_eq!(percentile(&sorted, 0), 1.0);
        assert_eq!(percentile(&[], 50), 0.0);
    }

    #[test]
    fn test_latency_percentiles_unsorted_input() {
        let p = LatencyPercentiles::from_samples(&[5.0, 1.0, 3.0, 2.0, 4.0]);
        assert_eq!(p.min_ms, 1.0);
        assert_eq!(p.median_ms, 3.0);
        assert_eq!(p.p99_ms, 5.0);
        assert_eq!(p.samples, 5);
    }

    #[test]
    fn test_progress_and_counts() {
        let instr = PhaseInstrumentation::new("cells", config(10, 100), None);
        instr.start(4);
        instr.increment(1, Duration::from_millis(10));
        instr.increment(2, Duration::from_millis(40));

        let metrics = instr.build_metrics();
        assert_eq!(metrics.items_done, 3);
        assert!((metrics.progress - 0.75).abs() < f64::EPSILON);
        assert_eq!(metrics.latency.samples, 2);
        assert_eq!(metrics.latency.min_ms, 10.0);
        assert_eq!(metrics.latency.p99_ms, 20.0);
    }

    #[test]
    fn test_latency_window_bounded() {
        let instr = PhaseInstrumentation::new("s", config(1000, 3), None);
        instr.start(10);
        for ms in [100, 1, 2, 3] {
            instr.increment(1, Duration::from_millis(ms));
        }
        let latency = instr.build_metrics().latency;
        assert_eq!(latency.samples, 3);
        assert_eq!(latency.min_ms, 1.0);
        assert_eq!(latency.p99_ms, 3.0);
    }

    #[test]
    fn test_snapshots_every_k_increments() {
        let monitor = Arc::new(ResourceMonitor::new(
            Arc::new(FixedResourceProbe::new(64.0, 5.0)),
            100,
        ));
        let instr = PhaseInstrumentation::new("s", config(5, 100), Some(monitor));
        instr.start(20);
        for _ in 0..12 {
            instr.increment(1, Duration::from_millis(1));
        }
        assert_eq!(instr.build_metrics().resource_history.len(), 2);

        // a batch increment crossing a boundary triggers one snapshot
        instr.increment(5, Duration::from_millis(5));
        assert_eq!(instr.build_metrics().resource_history.len(), 3);
    }

    #[test]
    fn test_warnings_and_errors_capped() {
        let instr = PhaseInstrumentation::new("s", config(10, 10), None);
        for i in 0..5 {
            instr.record_warning("slow", serde_json::json!({ "i": i }));
        }
        instr.record_error("sub_item", serde_json::json!({ "index": 7 }));

        let metrics = instr.build_metrics();
        assert_eq!(metrics.warnings.len(), 3);
        assert_eq!(metrics.errors.len(), 1);
        assert_eq!(metrics.errors[0].category, "sub_item");
    }

    #[test]
    fn test_zero_total_progress() {
        let instr = PhaseInstrumentation::new("s", config(10, 10), None);
        instr.start(0);
        assert_eq!(instr.build_metrics().progress, 0.0);
        instr.increment(1, Duration::ZERO);
        assert_eq!(instr.build_metrics().progress, 1.0);
    }
}
