//! One execution of an orchestrator's stage list.

use super::RunContext;
use crate::cancellation::{AbortSignal, CancellationToken};
use crate::config::RuntimeMode;
use crate::errors::{HandlerError, StageTimeoutError};
use crate::events::EventKind;
use crate::instrumentation::PhaseMetrics;
use crate::manifest::{ExecutionManifest, ManifestBuilder};
use crate::observability::{RunSpanAttributes, SpanTimer, StageSpanAttributes};
use crate::stages::{
    ExecutionMode, StageContext, StageDescriptor, StageHandler, StageResult, StageStatus,
};
use crate::timeout::{TimeoutHooks, TimeoutRecord};
use crate::tolerance::{ErrorToleranceState, ErrorToleranceTracker};
use chrono::Utc;
use futures::FutureExt;
use parking_lot::RwLock;
use serde_json::{json, Value};
use std::any::Any;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, info, warn, Instrument};

/// A prepared run. Executes at most once.
#[derive(Debug)]
pub struct PipelineRun {
    ctx: Arc<RunContext>,
    stages: Arc<[StageDescriptor]>,
    results: RwLock<Vec<StageResult>>,
    outputs: RwLock<BTreeMap<String, Value>>,
    manifest: tokio::sync::Mutex<Option<ExecutionManifest>>,
}

/// What a single stage produced, before it is folded into the run.
struct StageOutcome {
    result: StageResult,
    timeout: Option<TimeoutRecord>,
}

impl PipelineRun {
    pub(super) fn new(ctx: Arc<RunContext>, stages: Arc<[StageDescriptor]>) -> Self {
        Self {
            ctx,
            stages,
            results: RwLock::new(Vec::new()),
            outputs: RwLock::new(BTreeMap::new()),
            manifest: tokio::sync::Mutex::new(None),
        }
    }

    /// Returns the run id.
    #[must_use]
    pub fn run_id(&self) -> uuid::Uuid {
        self.ctx.run_id
    }

    /// Returns the run-wide abort signal.
    #[must_use]
    pub fn abort_signal(&self) -> Arc<AbortSignal> {
        Arc::clone(&self.ctx.abort)
    }

    /// Returns the shared run state.
    #[must_use]
    pub fn context(&self) -> &Arc<RunContext> {
        &self.ctx
    }

    /// Exports every stage's instrumentation. Safe to call mid-run.
    #[must_use]
    pub fn metrics(&self) -> BTreeMap<String, PhaseMetrics> {
        self.ctx.metrics.snapshot()
    }

    /// Returns the tolerance tallies recorded so far.
    #[must_use]
    pub fn tolerance_states(&self) -> BTreeMap<String, ErrorToleranceState> {
        self.ctx.tolerance.states()
    }

    /// Returns the stage results recorded so far, in declared order.
    #[must_use]
    pub fn results(&self) -> Vec<StageResult> {
        self.results.read().clone()
    }

    /// Returns a completed stage's output by its declared output name.
    #[must_use]
    pub fn output(&self, name: &str) -> Option<Value> {
        self.outputs.read().get(name).cloned()
    }

    /// Runs every stage in order and returns the manifest.
    ///
    /// A manifest is always produced. Calling this again returns the first
    /// manifest without re-running anything.
    pub async fn execute(&self, input: Value) -> ExecutionManifest {
        let mut slot = self.manifest.lock().await;
        if let Some(manifest) = slot.as_ref() {
            debug!(run_id = %self.ctx.run_id, "Run already executed; returning cached manifest");
            return manifest.clone();
        }

        let span = RunSpanAttributes::new(
            self.ctx.run_id,
            self.ctx.config.runtime_mode,
            self.stages.len(),
        )
        .span();
        let manifest = self.execute_inner(input).instrument(span).await;
        *slot = Some(manifest.clone());
        manifest
    }

    async fn execute_inner(&self, input: Value) -> ExecutionManifest {
        let ctx = &self.ctx;
        let mode = ctx.config.runtime_mode;
        let started_at = Utc::now();
        let mut builder = ManifestBuilder::new(ctx.run_id, mode, self.stages.len())
            .started_at(started_at);

        info!(
            run_id = %ctx.run_id,
            runtime_mode = %mode,
            stages = self.stages.len(),
            "Starting run"
        );
        ctx.sink.emit(
            EventKind::RunStarted,
            json!({
                "run_id": ctx.run_id,
                "runtime_mode": mode,
                "stages_total": self.stages.len(),
            }),
        );

        let sampler_stop = Arc::new(CancellationToken::new());
        let sampler = ctx
            .monitor
            .spawn_sampler(ctx.config.resources.sample_interval(), Arc::clone(&sampler_stop));

        let input = Arc::new(input);
        let mut abort_announced = false;

        for stage in self.stages.iter() {
            if ctx.abort.is_aborted() {
                self.announce_abort(&mut abort_announced);
                debug!(stage_id = stage.id(), "Abort set; stage not started");
                ctx.sink.emit(
                    EventKind::StageSkipped,
                    json!({
                        "stage_id": stage.id(),
                        "stage_name": stage.name(),
                        "reason": ctx.abort.get_reason(),
                    }),
                );
                let result = StageResult::not_started(stage.id(), stage.name());
                builder.push_result(result.clone());
                self.results.write().push(result);
                continue;
            }

            let outcome = self.run_stage(stage, &input).await;

            if let Some(record) = outcome.timeout {
                builder.push_timeout(record);
            }
            let result = outcome.result;
            if result.success {
                if let Some(output) = &result.output {
                    self.outputs
                        .write()
                        .insert(stage.output_name().to_string(), output.clone());
                }
            }
            builder.push_result(result.clone());
            self.results.write().push(result);
        }

        if ctx.abort.is_aborted() {
            self.announce_abort(&mut abort_announced);
        }

        sampler_stop.cancel("run finished");
        if let Err(err) = sampler.await {
            warn!(error = %err, "Resource sampler task ended abnormally");
        }

        let manifest = builder
            .tolerance(ctx.tolerance.states())
            .abort(ctx.abort.state())
            .build(Utc::now());

        info!(
            run_id = %ctx.run_id,
            success = manifest.success,
            partial_success = manifest.partial_success,
            stages_completed = manifest.stages_completed,
            stages_total = manifest.stages_total,
            duration_ms = manifest.duration_ms,
            "Run finished"
        );
        ctx.sink.emit(
            EventKind::RunCompleted,
            json!({
                "run_id": ctx.run_id,
                "success": manifest.success,
                "partial_success": manifest.partial_success,
                "stages_completed": manifest.stages_completed,
                "duration_ms": manifest.duration_ms,
            }),
        );
        manifest
    }

    fn announce_abort(&self, announced: &mut bool) {
        if *announced {
            return;
        }
        *announced = true;
        let state = self.ctx.abort.state();
        self.ctx.sink.emit(
            EventKind::RunAborted,
            json!({ "reason": state.reason, "timestamp": state.timestamp }),
        );
    }

    async fn run_stage(&self, stage: &StageDescriptor, input: &Arc<Value>) -> StageOutcome {
        let ctx = &self.ctx;
        let mode = ctx.config.runtime_mode;

        let instrumentation = ctx.metrics.register(stage.id());
        instrumentation.start(stage.expected_items());
        let tracker = stage
            .resolve_tolerance(ctx.config.tolerance)
            .map(|policy| ctx.tolerance.register(stage.id(), stage.expected_items(), policy));

        let cancel = Arc::new(CancellationToken::new());
        if let Some(tracker) = &tracker {
            // tallies freeze at the deadline even if the handler keeps going
            let tracker = Arc::clone(tracker);
            cancel.on_cancel(move || tracker.seal());
        }
        let mut stage_ctx = StageContext::new(
            stage.id(),
            stage.name(),
            Arc::clone(&ctx.abort),
            Arc::clone(&instrumentation),
        )
        .with_input(Arc::clone(input))
        .with_outputs(Arc::new(self.outputs.read().clone()))
        .with_cancel(Arc::clone(&cancel));
        if let Some(tracker) = &tracker {
            stage_ctx = stage_ctx.with_tolerance(Arc::clone(tracker));
        }
        if stage.mode() == ExecutionMode::Cooperative {
            stage_ctx = stage_ctx.with_pool(Arc::clone(&ctx.pool));
        }

        let timeout_s = ctx.guard.resolve(stage.id(), stage.base_timeout_s(), mode);
        info!(
            stage_id = stage.id(),
            stage_name = stage.name(),
            mode = %stage.mode(),
            timeout_s,
            "Starting stage"
        );
        ctx.sink.emit(
            EventKind::StageStarted,
            json!({
                "stage_id": stage.id(),
                "stage_name": stage.name(),
                "mode": stage.mode(),
                "timeout_s": timeout_s,
            }),
        );

        let hooks = {
            let sink = Arc::clone(&ctx.sink);
            let instrumentation = Arc::clone(&instrumentation);
            TimeoutHooks::new()
                .with_cancel(cancel)
                .with_partial(Arc::clone(stage_ctx.partial_slot()))
                .on_warning(move |warning| {
                    let payload = serde_json::to_value(warning).unwrap_or_default();
                    instrumentation.record_warning("timeout_warning", payload.clone());
                    sink.emit(EventKind::StageTimeoutWarning, payload);
                })
        };

        let span = StageSpanAttributes::for_stage(stage, timeout_s).span();
        let timer = SpanTimer::start();
        let outcome = ctx
            .guard
            .execute_with_timeout(
                invoke(stage.handler().clone(), stage_ctx),
                timeout_s,
                stage.id(),
                stage.name(),
                &hooks,
            )
            .instrument(span)
            .await;
        let duration_ms = timer.elapsed_ms();

        let outcome = match outcome {
            Ok(handler_result) => StageOutcome {
                result: self.classify(stage, handler_result, tracker.as_deref(), duration_ms),
                timeout: None,
            },
            Err(timeout) => self.on_timeout(stage, timeout, duration_ms),
        };
        self.after_stage(stage, &outcome.result);
        outcome
    }

    fn classify(
        &self,
        stage: &StageDescriptor,
        handler_result: Result<Value, HandlerError>,
        tracker: Option<&ErrorToleranceTracker>,
        duration_ms: f64,
    ) -> StageResult {
        let mode = self.ctx.config.runtime_mode;
        let (id, name) = (stage.id(), stage.name());

        match handler_result {
            Ok(output) => match tracker {
                None => StageResult::completed(id, name, output, duration_ms),
                Some(t) => {
                    let state = t.state();
                    if !t.can_mark_success(mode) {
                        StageResult::failed(id, name, rejected_message(t, mode), duration_ms)
                    } else if state.failed > 0 {
                        StageResult::degraded(
                            id,
                            name,
                            Some(output),
                            Some(tolerated_message(&state)),
                            duration_ms,
                        )
                    } else {
                        StageResult::completed(id, name, output, duration_ms)
                    }
                }
            },
            Err(HandlerError::Aborted { reason }) if self.ctx.abort.is_aborted() => {
                StageResult::aborted(id, name, reason, duration_ms)
            }
            Err(err) => match tracker {
                Some(t) if t.has_records() && t.can_mark_success(mode) => {
                    StageResult::degraded(id, name, None, Some(err.to_string()), duration_ms)
                }
                _ => StageResult::failed(id, name, err.to_string(), duration_ms),
            },
        }
    }

    fn on_timeout(
        &self,
        stage: &StageDescriptor,
        timeout: StageTimeoutError,
        duration_ms: f64,
    ) -> StageOutcome {
        let record = TimeoutRecord::from(&timeout);
        self.ctx.sink.emit(
            EventKind::StageTimeout,
            serde_json::to_value(&timeout).unwrap_or_default(),
        );
        StageOutcome {
            result: StageResult::timed_out(
                stage.id(),
                stage.name(),
                timeout.to_string(),
                timeout.partial_result,
                duration_ms,
            ),
            timeout: Some(record),
        }
    }

    fn after_stage(&self, stage: &StageDescriptor, result: &StageResult) {
        let ctx = &self.ctx;
        let payload = json!({
            "stage_id": result.stage_id,
            "stage_name": result.stage_name,
            "status": result.status,
            "duration_ms": result.duration_ms,
            "error": result.error,
        });

        match result.status {
            StageStatus::Completed => {
                info!(stage_id = stage.id(), duration_ms = result.duration_ms, "Stage completed");
                ctx.sink.emit(EventKind::StageCompleted, payload);
            }
            StageStatus::Degraded => {
                warn!(
                    stage_id = stage.id(),
                    error = result.error.as_deref().unwrap_or_default(),
                    "Stage completed with tolerated failures"
                );
                ctx.sink.emit(EventKind::StageDegraded, payload);
            }
            StageStatus::Aborted => {
                warn!(stage_id = stage.id(), "Stage observed abort");
                ctx.sink.emit(EventKind::StageAborted, payload);
            }
            StageStatus::Failed => {
                let message = result.error.clone().unwrap_or_default();
                error!(stage_id = stage.id(), error = %message, "Stage failed");
                if let Some(instr) = ctx.metrics.get(stage.id()) {
                    instr.record_error("stage_failed", json!({ "error": &message }));
                }
                ctx.sink.emit(EventKind::StageFailed, payload);
                ctx.abort
                    .abort(format!("Stage '{}' failed: {message}", stage.id()));
            }
            StageStatus::TimedOut => {
                if let Some(instr) = ctx.metrics.get(stage.id()) {
                    instr.record_error("stage_timeout", payload);
                }
                ctx.abort.abort(format!("Stage '{}' timed out", stage.id()));
            }
            StageStatus::NotStarted => {}
        }
    }
}

async fn invoke(handler: StageHandler, ctx: StageContext) -> Result<Value, HandlerError> {
    match handler {
        StageHandler::Blocking(handler) => {
            match tokio::task::spawn_blocking(move || handler.run(&ctx)).await {
                Ok(result) => result,
                Err(err) if err.is_panic() => {
                    Err(HandlerError::Panicked(panic_message(err.into_panic().as_ref())))
                }
                Err(err) => Err(HandlerError::Panicked(err.to_string())),
            }
        }
        StageHandler::Cooperative(handler) => {
            match AssertUnwindSafe(handler.run(&ctx)).catch_unwind().await {
                Ok(result) => result,
                Err(payload) => Err(HandlerError::Panicked(panic_message(payload.as_ref()))),
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "handler panicked".to_string())
}

fn tolerated_message(state: &ErrorToleranceState) -> String {
    format!(
        "{} of {} sub-items failed (rate {:.3})",
        state.failed,
        state.succeeded + state.failed,
        state.failure_rate()
    )
}

#[allow(clippy::cast_precision_loss)]
fn rejected_message(tracker: &ErrorToleranceTracker, mode: RuntimeMode) -> String {
    let state = tracker.state();
    if mode.is_strict() {
        format!(
            "Failure tolerance exceeded: {} of {} sub-items failed (rate {:.3}, max {:.3})",
            state.failed,
            state.succeeded + state.failed,
            state.failure_rate(),
            state.max_failure_rate
        )
    } else {
        let required = tracker.policy().min_success_ratio * state.total as f64;
        format!(
            "Too few sub-items succeeded: {} of {} (required {:.1})",
            state.succeeded, state.total, required
        )
    }
}
