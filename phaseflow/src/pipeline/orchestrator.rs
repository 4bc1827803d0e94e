//! The orchestrator and the state one run threads through its stages.

use super::{OrchestratorBuilder, PipelineRun};
use crate::cancellation::AbortSignal;
use crate::config::OrchestratorConfig;
use crate::events::EventSink;
use crate::instrumentation::MetricsRegistry;
use crate::manifest::ExecutionManifest;
use crate::resources::{AdaptiveWorkerPool, ResourceMonitor, ResourceProbe};
use crate::stages::StageDescriptor;
use crate::timeout::TimeoutGuard;
use crate::tolerance::ToleranceRegistry;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Everything shared by one run, constructed once and passed explicitly.
pub struct RunContext {
    /// Run identifier.
    pub run_id: Uuid,
    /// Configuration in effect.
    pub config: Arc<OrchestratorConfig>,
    /// Run-wide abort signal.
    pub abort: Arc<AbortSignal>,
    /// Resource sampler.
    pub monitor: Arc<ResourceMonitor>,
    /// Worker sizing for cooperative fan-out.
    pub pool: Arc<AdaptiveWorkerPool>,
    /// Tolerance trackers of tolerant stages.
    pub tolerance: Arc<ToleranceRegistry>,
    /// Per-stage instrumentation.
    pub metrics: Arc<MetricsRegistry>,
    /// Timeout resolution and enforcement.
    pub guard: TimeoutGuard,
    /// Lifecycle event sink.
    pub sink: Arc<dyn EventSink>,
}

impl fmt::Debug for RunContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunContext")
            .field("run_id", &self.run_id)
            .field("runtime_mode", &self.config.runtime_mode)
            .field("aborted", &self.abort.is_aborted())
            .field("workers", &self.pool.current_workers())
            .finish_non_exhaustive()
    }
}

impl RunContext {
    /// Builds fresh run state from configuration.
    #[must_use]
    pub fn new(
        config: Arc<OrchestratorConfig>,
        probe: Arc<dyn ResourceProbe>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let monitor = Arc::new(ResourceMonitor::new(probe, config.resources.history_len));
        let pool = Arc::new(AdaptiveWorkerPool::new(
            config.resources.clone(),
            Arc::clone(&monitor),
        ));
        let metrics = Arc::new(MetricsRegistry::new(
            config.instrumentation.clone(),
            Some(Arc::clone(&monitor)),
        ));
        Self {
            run_id: Uuid::new_v4(),
            guard: TimeoutGuard::from_config(&config),
            config,
            abort: Arc::new(AbortSignal::new()),
            monitor,
            pool,
            tolerance: Arc::new(ToleranceRegistry::new()),
            metrics,
            sink,
        }
    }
}

/// Runs a fixed, linear list of stages.
pub struct Orchestrator {
    config: Arc<OrchestratorConfig>,
    stages: Arc<[StageDescriptor]>,
    lookup: HashMap<String, usize>,
    probe: Arc<dyn ResourceProbe>,
    sink: Arc<dyn EventSink>,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("runtime_mode", &self.config.runtime_mode)
            .field("stages", &self.stages.iter().map(StageDescriptor::id).collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    pub(super) fn new(
        config: Arc<OrchestratorConfig>,
        stages: Arc<[StageDescriptor]>,
        lookup: HashMap<String, usize>,
        probe: Arc<dyn ResourceProbe>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            config,
            stages,
            lookup,
            probe,
            sink,
        }
    }

    /// Returns a new builder.
    #[must_use]
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::new()
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Returns the stages in declared order.
    #[must_use]
    pub fn stages(&self) -> &[StageDescriptor] {
        &self.stages
    }

    /// Looks up a stage by id.
    #[must_use]
    pub fn stage(&self, id: &str) -> Option<&StageDescriptor> {
        self.lookup.get(id).and_then(|&index| self.stages.get(index))
    }

    /// Creates a run handle with fresh state.
    ///
    /// The handle exposes the abort signal and live metrics before and
    /// during execution.
    #[must_use]
    pub fn prepare(&self) -> PipelineRun {
        let ctx = RunContext::new(
            Arc::clone(&self.config),
            Arc::clone(&self.probe),
            Arc::clone(&self.sink),
        );
        PipelineRun::new(Arc::new(ctx), Arc::clone(&self.stages))
    }

    /// Runs every stage once and returns the manifest.
    pub async fn run(&self, input: serde_json::Value) -> ExecutionManifest {
        self.prepare().execute(input).await
    }
}
