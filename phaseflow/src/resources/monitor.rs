//! Resource sampling with a bounded rolling history.

use super::probe::{ResourceProbe, ResourceReading};
use crate::cancellation::CancellationToken;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

/// Memory/CPU usage at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    /// Resident memory in megabytes.
    pub memory_mb: f64,
    /// CPU usage in percent.
    pub cpu_percent: f64,
    /// Worker count in effect when sampled.
    pub worker_count: usize,
    /// When the sample was taken.
    pub timestamp: DateTime<Utc>,
}

/// Samples a [`ResourceProbe`] and retains the last `capacity` snapshots.
pub struct ResourceMonitor {
    probe: Arc<dyn ResourceProbe>,
    history: Mutex<VecDeque<ResourceSnapshot>>,
    capacity: usize,
    worker_count: AtomicUsize,
    probe_failures: AtomicU64,
}

impl ResourceMonitor {
    /// Creates a monitor retaining at most `history_len` snapshots.
    #[must_use]
    pub fn new(probe: Arc<dyn ResourceProbe>, history_len: usize) -> Self {
        let capacity = history_len.max(1);
        Self {
            probe,
            history: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            worker_count: AtomicUsize::new(0),
            probe_failures: AtomicU64::new(0),
        }
    }

    /// Takes a snapshot and appends it to the history, evicting the oldest.
    ///
    /// Probe failures yield a zero reading.
    pub fn sample(&self) -> ResourceSnapshot {
        let reading = self.probe.read().unwrap_or_else(|err| {
            self.probe_failures.fetch_add(1, Ordering::Relaxed);
            debug!(error = %err, "Resource probe failed; recording zero reading");
            ResourceReading::default()
        });

        let snapshot = ResourceSnapshot {
            memory_mb: reading.memory_mb,
            cpu_percent: reading.cpu_percent,
            worker_count: self.worker_count.load(Ordering::Relaxed),
            timestamp: Utc::now(),
        };

        let mut history = self.history.lock();
        while history.len() >= self.capacity {
            history.pop_front();
        }
        history.push_back(snapshot.clone());
        snapshot
    }

    /// Returns the most recent snapshot.
    #[must_use]
    pub fn latest(&self) -> Option<ResourceSnapshot> {
        self.history.lock().back().cloned()
    }

    /// Returns the retained snapshots, oldest first.
    #[must_use]
    pub fn history(&self) -> Vec<ResourceSnapshot> {
        self.history.lock().iter().cloned().collect()
    }

    /// Returns the history capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Records the worker count stamped onto later snapshots.
    pub fn set_worker_count(&self, workers: usize) {
        self.worker_count.store(workers, Ordering::Relaxed);
    }

    /// Returns how many probe reads have failed.
    #[must_use]
    pub fn probe_failures(&self) -> u64 {
        self.probe_failures.load(Ordering::Relaxed)
    }

    /// Samples every `interval` until `stop` is cancelled.
    pub fn spawn_sampler(
        self: &Arc<Self>,
        interval: Duration,
        stop: Arc<CancellationToken>,
    ) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        monitor.sample();
                    }
                }
            }
            debug!("Resource sampler stopped");
        })
    }
}

impl std::fmt::Debug for ResourceMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceMonitor")
            .field("capacity", &self.capacity)
            .field("samples", &self.history.lock().len())
            .field("worker_count", &self.worker_count.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
