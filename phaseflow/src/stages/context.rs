//! Per-stage execution context.
//!
//! Built by the orchestrator for each stage from the run's state and handed
//! to the handler. Cloning is cheap; every field is shared.

use crate::cancellation::{AbortSignal, AbortView, CancellationToken};
use crate::config::InstrumentationConfig;
use crate::errors::HandlerError;
use crate::instrumentation::PhaseInstrumentation;
use crate::resources::AdaptiveWorkerPool;
use crate::tolerance::ErrorToleranceTracker;
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Why a fan-out stopped before processing every sub-item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Interruption {
    /// The run-wide abort signal was set.
    Aborted {
        /// Abort reason.
        reason: String,
    },
    /// The stage-local token was cancelled (usually by the timeout guard).
    Cancelled {
        /// Cancellation reason.
        reason: String,
    },
}

impl From<Interruption> for HandlerError {
    fn from(value: Interruption) -> Self {
        match value {
            Interruption::Aborted { reason } => Self::Aborted { reason },
            Interruption::Cancelled { reason } => Self::Cancelled { reason },
        }
    }
}

/// Outcome of [`StageContext::fan_out`], keyed by sub-item index.
#[derive(Debug, Clone, PartialEq)]
pub struct FanOutReport<T> {
    /// Number of sub-items submitted.
    pub total: usize,
    /// Successful sub-item results.
    pub results: BTreeMap<usize, T>,
    /// Failed sub-items and their error messages.
    pub failures: BTreeMap<usize, String>,
    /// Set when processing stopped early.
    pub interrupted: Option<Interruption>,
}

impl<T> FanOutReport<T> {
    fn new(total: usize) -> Self {
        Self {
            total,
            results: BTreeMap::new(),
            failures: BTreeMap::new(),
            interrupted: None,
        }
    }

    /// Number of sub-items that ran to an outcome.
    #[must_use]
    pub fn processed(&self) -> usize {
        self.results.len() + self.failures.len()
    }

    /// Returns true when every sub-item ran and none failed.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.interrupted.is_none() && self.failures.is_empty() && self.processed() == self.total
    }

    /// Converts an interrupted report into the matching handler error.
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError::Aborted`] or [`HandlerError::Cancelled`] if
    /// processing stopped early.
    pub fn into_complete(self) -> Result<Self, HandlerError> {
        match self.interrupted {
            Some(interruption) => Err(interruption.into()),
            None => Ok(self),
        }
    }
}

/// Everything a handler may see or touch while its stage runs.
#[derive(Clone)]
pub struct StageContext {
    stage_id: Arc<str>,
    stage_name: Arc<str>,
    input: Arc<Value>,
    outputs: Arc<BTreeMap<String, Value>>,
    abort: AbortView,
    cancel: Arc<CancellationToken>,
    instrumentation: Arc<PhaseInstrumentation>,
    tolerance: Option<Arc<ErrorToleranceTracker>>,
    pool: Option<Arc<AdaptiveWorkerPool>>,
    partial: Arc<Mutex<Option<Value>>>,
}

impl fmt::Debug for StageContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageContext")
            .field("stage_id", &self.stage_id)
            .field("stage_name", &self.stage_name)
            .field("outputs", &self.outputs.keys().collect::<Vec<_>>())
            .field("aborted", &self.abort.is_aborted())
            .field("cancelled", &self.cancel.is_cancelled())
            .field("tolerant", &self.tolerance.is_some())
            .finish_non_exhaustive()
    }
}

impl StageContext {
    /// Creates a context wired to the given run state.
    #[must_use]
    pub fn new(
        stage_id: &str,
        stage_name: &str,
        abort: Arc<AbortSignal>,
        instrumentation: Arc<PhaseInstrumentation>,
    ) -> Self {
        Self {
            stage_id: Arc::from(stage_id),
            stage_name: Arc::from(stage_name),
            input: Arc::new(Value::Null),
            outputs: Arc::new(BTreeMap::new()),
            abort: AbortView::new(abort),
            cancel: Arc::new(CancellationToken::new()),
            instrumentation,
            tolerance: None,
            pool: None,
            partial: Arc::new(Mutex::new(None)),
        }
    }

    /// Creates a context with its own abort signal and instrumentation.
    ///
    /// Useful for exercising handlers outside an orchestrator.
    #[must_use]
    pub fn detached(stage_id: &str, stage_name: &str) -> Self {
        let instrumentation = Arc::new(PhaseInstrumentation::new(
            stage_id,
            InstrumentationConfig::default(),
            None,
        ));
        Self::new(stage_id, stage_name, Arc::new(AbortSignal::new()), instrumentation)
    }

    /// Sets the run input.
    #[must_use]
    pub fn with_input(mut self, input: Arc<Value>) -> Self {
        self.input = input;
        self
    }

    /// Sets the prior stage outputs.
    #[must_use]
    pub fn with_outputs(mut self, outputs: Arc<BTreeMap<String, Value>>) -> Self {
        self.outputs = outputs;
        self
    }

    /// Sets the stage-local cancellation token.
    #[must_use]
    pub fn with_cancel(mut self, cancel: Arc<CancellationToken>) -> Self {
        self.cancel = cancel;
        self
    }

    /// Attaches an error-tolerance tracker.
    #[must_use]
    pub fn with_tolerance(mut self, tracker: Arc<ErrorToleranceTracker>) -> Self {
        self.tolerance = Some(tracker);
        self
    }

    /// Attaches the worker pool used to size fan-out.
    #[must_use]
    pub fn with_pool(mut self, pool: Arc<AdaptiveWorkerPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Returns the stage id.
    #[must_use]
    pub fn stage_id(&self) -> &str {
        &self.stage_id
    }

    /// Returns the stage name.
    #[must_use]
    pub fn stage_name(&self) -> &str {
        &self.stage_name
    }

    /// Returns the run input.
    #[must_use]
    pub fn input(&self) -> &Value {
        &self.input
    }

    /// Returns a prior stage's output by its declared output name.
    #[must_use]
    pub fn output(&self, name: &str) -> Option<&Value> {
        self.outputs.get(name)
    }

    /// Returns a prior stage's output, or a `MissingInput` error.
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError::MissingInput`] if no prior stage produced `name`.
    pub fn require_output(&self, name: &str) -> Result<&Value, HandlerError> {
        self.output(name).ok_or_else(|| HandlerError::MissingInput {
            name: name.to_string(),
        })
    }

    /// Returns the read-only abort view.
    #[must_use]
    pub fn abort(&self) -> &AbortView {
        &self.abort
    }

    /// Returns the stage-local cancellation token.
    #[must_use]
    pub fn cancel_token(&self) -> &Arc<CancellationToken> {
        &self.cancel
    }

    /// Returns true if the run has been aborted.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.abort.is_aborted()
    }

    /// Returns true if this stage has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Returns true if the handler should stop doing work.
    #[must_use]
    pub fn should_stop(&self) -> bool {
        self.is_aborted() || self.is_cancelled()
    }

    /// Returns an error if the handler should stop.
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError::Aborted`] if the run was aborted, or
    /// [`HandlerError::Cancelled`] if this stage was cancelled.
    pub fn check_continue(&self) -> Result<(), HandlerError> {
        match self.interruption() {
            Some(interruption) => Err(interruption.into()),
            None => Ok(()),
        }
    }

    /// Publishes a partial result, reported if the stage times out.
    pub fn publish_partial(&self, value: Value) {
        *self.partial.lock() = Some(value);
    }

    /// Returns the last published partial result.
    #[must_use]
    pub fn partial(&self) -> Option<Value> {
        self.partial.lock().clone()
    }

    /// Returns the shared partial-result slot.
    #[must_use]
    pub fn partial_slot(&self) -> &Arc<Mutex<Option<Value>>> {
        &self.partial
    }

    /// Returns the stage's instrumentation.
    #[must_use]
    pub fn instrumentation(&self) -> &Arc<PhaseInstrumentation> {
        &self.instrumentation
    }

    /// Returns the stage's tolerance tracker, if it has a policy.
    #[must_use]
    pub fn tolerance(&self) -> Option<&Arc<ErrorToleranceTracker>> {
        self.tolerance.as_ref()
    }

    /// Records a warning against this stage.
    pub fn record_warning(&self, category: &str, payload: Value) {
        self.instrumentation.record_warning(category, payload);
    }

    /// Records one successful sub-item.
    pub fn record_item_success(&self, latency: Duration) {
        if let Some(tracker) = &self.tolerance {
            tracker.record_success();
        }
        self.instrumentation.increment(1, latency);
    }

    /// Records one failed sub-item.
    pub fn record_item_failure(&self, latency: Duration, error: impl fmt::Display) {
        if let Some(tracker) = &self.tolerance {
            tracker.record_failure();
        }
        self.instrumentation.increment(1, latency);
        self.instrumentation
            .record_error("sub_item_failed", json!({ "error": error.to_string() }));
    }

    /// Returns the current target concurrency, for cooperative stages.
    #[must_use]
    pub fn concurrency_hint(&self) -> Option<usize> {
        self.pool.as_ref().map(|pool| pool.current_workers())
    }

    /// Processes `items` concurrently in batches sized by the worker pool.
    ///
    /// The batch size is recomputed from resource pressure and the remaining
    /// backlog before every batch; without a pool, items run one at a time.
    /// Abort and cancellation are checked before each batch. Every outcome is
    /// tallied in the tolerance tracker and instrumentation and reduced by
    /// sub-item index. Repeated calls add to the expected totals.
    ///
    /// A batch's futures are polled together on the calling task, so they
    /// overlap only at `.await` points. CPU-bound items should move their
    /// work onto the blocking pool, e.g. with `tokio::task::spawn_blocking`
    /// inside `work`.
    pub async fn fan_out<I, T, F, Fut>(&self, items: Vec<I>, work: F) -> FanOutReport<T>
    where
        F: Fn(usize, I) -> Fut,
        Fut: Future<Output = Result<T, HandlerError>>,
    {
        let total = items.len();
        let mut report = FanOutReport::new(total);
        if let Some(tracker) = &self.tolerance {
            tracker.reserve(total as u64);
        }
        self.instrumentation.reserve(total as u64);

        let mut pending = items.into_iter().enumerate().peekable();
        let mut remaining = total;

        while pending.peek().is_some() {
            if let Some(interruption) = self.interruption() {
                report.interrupted = Some(interruption);
                break;
            }

            let batch_size = self
                .pool
                .as_ref()
                .map_or(1, |pool| pool.compute_target_workers(remaining))
                .max(1);
            debug!(
                stage_id = %self.stage_id,
                batch_size,
                remaining,
                "Dispatching fan-out batch"
            );

            let mut in_flight: FuturesUnordered<_> = pending
                .by_ref()
                .take(batch_size)
                .map(|(index, item)| {
                    let fut = work(index, item);
                    async move {
                        let started = Instant::now();
                        let outcome = fut.await;
                        (index, outcome, started.elapsed())
                    }
                })
                .collect();
            remaining = remaining.saturating_sub(in_flight.len());

            while let Some((index, outcome, latency)) = in_flight.next().await {
                match outcome {
                    Ok(value) => {
                        self.record_item_success(latency);
                        report.results.insert(index, value);
                    }
                    Err(err) if err.is_interruption() => {
                        if report.interrupted.is_none() {
                            report.interrupted = self.interruption().or(Some(match err {
                                HandlerError::Aborted { reason } => {
                                    Interruption::Aborted { reason }
                                }
                                other => Interruption::Cancelled {
                                    reason: other.to_string(),
                                },
                            }));
                        }
                    }
                    Err(err) => {
                        let message = err.to_string();
                        if let Some(tracker) = &self.tolerance {
                            tracker.record_failure();
                        }
                        self.instrumentation.increment(1, latency);
                        self.instrumentation.record_error(
                            "sub_item_failed",
                            json!({ "index": index, "error": &message }),
                        );
                        report.failures.insert(index, message);
                    }
                }
            }

            if report.interrupted.is_some() {
                break;
            }
        }

        report
    }

    fn interruption(&self) -> Option<Interruption> {
        if self.abort.is_aborted() {
            return Some(Interruption::Aborted {
                reason: self.abort.reason().unwrap_or_default(),
            });
        }
        if self.cancel.is_cancelled() {
            return Some(Interruption::Cancelled {
                reason: self.cancel.reason().unwrap_or_default(),
            });
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResourceLimits;
    use crate::resources::{FixedResourceProbe, ResourceMonitor};
    use crate::tolerance::TolerancePolicy;
    use pretty_assertions::assert_eq;

    fn pool(max_workers: usize) -> Arc<AdaptiveWorkerPool> {
        let monitor = Arc::new(ResourceMonitor::new(
            Arc::new(FixedResourceProbe::new(10.0, 1.0)),
            8,
        ));
        let limits = ResourceLimits::default().with_workers(1, max_workers, max_workers);
        Arc::new(AdaptiveWorkerPool::new(limits, monitor))
    }

    #[test]
    fn test_outputs_and_missing_input() {
        let mut outputs = BTreeMap::new();
        outputs.insert("grid".to_string(), json!([1, 2]));
        let ctx = StageContext::detached("score", "Score")
            .with_input(Arc::new(json!({"path": "/data"})))
            .with_outputs(Arc::new(outputs));

        assert_eq!(ctx.input()["path"], "/data");
        assert_eq!(ctx.require_output("grid").unwrap(), &json!([1, 2]));
        let err = ctx.require_output("report").unwrap_err();
        assert!(matches!(err, HandlerError::MissingInput { name } if name == "report"));
    }

    #[test]
    fn test_check_continue_reports_abort_before_cancel() {
        let abort = Arc::new(AbortSignal::new());
        let ctx = StageContext::detached("s", "S");
        let ctx = StageContext::new("s", "S", abort.clone(), ctx.instrumentation().clone());
        assert!(ctx.check_continue().is_ok());

        ctx.cancel_token().cancel("deadline");
        assert!(matches!(
            ctx.check_continue(),
            Err(HandlerError::Cancelled { reason }) if reason == "deadline"
        ));

        abort.abort("operator");
        assert!(matches!(
            ctx.check_continue(),
            Err(HandlerError::Aborted { reason }) if reason == "operator"
        ));
    }

    #[test]
    fn test_partial_slot_is_shared_by_clones() {
        let ctx = StageContext::detached("s", "S");
        let clone = ctx.clone();
        clone.publish_partial(json!({"rows": 3}));
        assert_eq!(ctx.partial(), Some(json!({"rows": 3})));
    }

    #[test]
    fn test_item_records_feed_tracker_and_instrumentation() {
        let tracker = Arc::new(ErrorToleranceTracker::new("s", 3, TolerancePolicy::default()));
        let ctx = StageContext::detached("s", "S").with_tolerance(tracker.clone());
        ctx.record_item_success(Duration::from_millis(2));
        ctx.record_item_failure(Duration::from_millis(4), "bad cell");

        let state = tracker.state();
        assert_eq!((state.succeeded, state.failed), (1, 1));
        let metrics = ctx.instrumentation().build_metrics();
        assert_eq!(metrics.items_done, 2);
        assert_eq!(metrics.errors.len(), 1);
    }

    #[tokio::test]
    async fn test_fan_out_reduces_by_index() {
        let tracker = Arc::new(ErrorToleranceTracker::new("grid", 0, TolerancePolicy::default()));
        let ctx = StageContext::detached("grid", "Grid")
            .with_pool(pool(4))
            .with_tolerance(tracker.clone());

        let items: Vec<u64> = (0..20).collect();
        let report = ctx
            .fan_out(items, |index, n| async move {
                // later items finish first
                tokio::time::sleep(Duration::from_millis(20 - n)).await;
                if index % 5 == 0 {
                    Err(HandlerError::failed(format!("cell {index} failed")))
                } else {
                    Ok(n * 10)
                }
            })
            .await;

        assert_eq!(report.total, 20);
        assert_eq!(report.processed(), 20);
        assert_eq!(report.failures.keys().copied().collect::<Vec<_>>(), vec![0, 5, 10, 15]);
        assert_eq!(report.results[&7], 70);
        assert!(report.interrupted.is_none());
        assert!(!report.is_clean());

        let state = tracker.state();
        assert_eq!(state.total, 20);
        assert_eq!((state.succeeded, state.failed), (16, 4));
        assert_eq!(ctx.instrumentation().items_done(), 20);
    }

    #[tokio::test]
    async fn test_repeated_fan_out_accumulates_totals() {
        let tracker = Arc::new(ErrorToleranceTracker::new("grid", 0, TolerancePolicy::default()));
        let ctx = StageContext::detached("grid", "Grid")
            .with_pool(pool(4))
            .with_tolerance(tracker.clone());

        let first = ctx
            .fan_out((0..10).collect::<Vec<u64>>(), |_, n| async move {
                Ok::<_, HandlerError>(n)
            })
            .await;
        assert!(first.is_clean());

        let second = ctx
            .fan_out((0..10).collect::<Vec<u64>>(), |index, n| async move {
                if index % 2 == 0 {
                    Err(HandlerError::failed(format!("row {index} failed")))
                } else {
                    Ok(n)
                }
            })
            .await;
        assert_eq!(second.failures.len(), 5);

        let state = tracker.state();
        assert_eq!(state.total, 20);
        assert_eq!((state.succeeded, state.failed), (15, 5));
        assert_eq!(ctx.instrumentation().build_metrics().items_total, 20);
    }

    #[tokio::test]
    async fn test_fan_out_runs_blocking_items_off_the_task() {
        let ctx = StageContext::detached("grid", "Grid").with_pool(pool(4));
        let report = ctx
            .fan_out((0..8).collect::<Vec<u64>>(), |_, n| async move {
                tokio::task::spawn_blocking(move || n * n)
                    .await
                    .map_err(|err| HandlerError::failed(err.to_string()))
            })
            .await;

        assert!(report.is_clean());
        assert_eq!(report.results[&3], 9);
    }

    #[tokio::test]
    async fn test_fan_out_never_exceeds_pool_size() {
        let ctx = StageContext::detached("grid", "Grid").with_pool(pool(3));
        let active = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let peak = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let report = ctx
            .fan_out((0..30).collect::<Vec<_>>(), |_, n: i32| {
                let active = active.clone();
                let peak = peak.clone();
                async move {
                    use std::sync::atomic::Ordering;
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::task::yield_now().await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(n)
                }
            })
            .await;

        assert!(report.is_clean());
        assert!(peak.load(std::sync::atomic::Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_fan_out_stops_on_abort() {
        let abort = Arc::new(AbortSignal::new());
        let base = StageContext::detached("grid", "Grid");
        let ctx = StageContext::new("grid", "Grid", abort.clone(), base.instrumentation().clone());

        let report = ctx
            .fan_out((0..10).collect::<Vec<_>>(), |index, n: i32| {
                let abort = abort.clone();
                async move {
                    if index == 2 {
                        abort.abort("operator stop");
                    }
                    Ok(n)
                }
            })
            .await;

        assert_eq!(report.processed(), 3);
        assert_eq!(
            report.interrupted,
            Some(Interruption::Aborted {
                reason: "operator stop".to_string()
            })
        );
        assert!(matches!(
            report.into_complete(),
            Err(HandlerError::Aborted { .. })
        ));
    }

    #[tokio::test]
    async fn test_fan_out_on_cancelled_context_does_nothing() {
        let ctx = StageContext::detached("grid", "Grid");
        ctx.cancel_token().cancel("timeout");
        let report = ctx
            .fan_out(vec![1, 2, 3], |_, n: i32| async move { Ok(n) })
            .await;
        assert_eq!(report.processed(), 0);
        assert!(matches!(report.interrupted, Some(Interruption::Cancelled { .. })));
    }
}
