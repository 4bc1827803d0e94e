//! # Phaseflow
//!
//! Runs a fixed, ordered list of stages with per-stage deadlines, a
//! run-wide abort signal, adaptive worker sizing, error tolerance and
//! instrumentation, and reports every run in an [`ExecutionManifest`].
//!
//! Phaseflow provides:
//!
//! - **Runtime modes**: strict, relaxed and exploratory profiles scale
//!   timeouts and relax success criteria
//! - **Timeout guard**: a warning at a configurable fraction of the
//!   deadline, then cancellation with partial results kept
//! - **Abort propagation**: the first fatal failure stops the remaining stages
//! - **Adaptive workers**: fan-out concurrency follows memory and CPU headroom
//! - **Error tolerance**: stages made of many sub-items may succeed partially
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use phaseflow::prelude::*;
//! use serde_json::json;
//!
//! let orchestrator = Orchestrator::builder()
//!     .config(OrchestratorConfig::default().with_runtime_mode(RuntimeMode::Relaxed))
//!     .stage(StageDescriptor::blocking("ingest", "Ingest", |ctx| Ok(ctx.input().clone())))
//!     .stage(
//!         StageDescriptor::cooperative("score", "Score", |ctx| async move {
//!             let rows = ctx.require_output("ingest")?.clone();
//!             Ok(json!({ "rows": rows }))
//!         })
//!         .with_timeout(30.0),
//!     )
//!     .build()?;
//!
//! let manifest = orchestrator.run(json!({ "path": "data.csv" })).await;
//! assert!(manifest.success);
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod config;
pub mod errors;
pub mod events;
pub mod instrumentation;
pub mod manifest;
pub mod observability;
pub mod pipeline;
pub mod resources;
pub mod stages;
pub mod timeout;
pub mod tolerance;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use errors::{PhaseflowError, Result};
pub use manifest::ExecutionManifest;
pub use pipeline::{Orchestrator, OrchestratorBuilder, PipelineRun};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::{AbortSignal, AbortView, CancellationToken};
    pub use crate::config::{
        InstrumentationConfig, OrchestratorConfig, ResourceLimits, RuntimeMode, TimeoutTable,
        ToleranceDefaults,
    };
    pub use crate::errors::{
        ConfigError, HandlerError, PhaseflowError, PipelineValidationError, StageTimeoutError,
    };
    pub use crate::events::{
        CollectingEventSink, EventKind, EventSink, LoggingEventSink, NoOpEventSink,
    };
    pub use crate::instrumentation::{LatencyPercentiles, PhaseMetrics};
    pub use crate::manifest::{ExecutionManifest, StageSummary, ToleranceSummary};
    pub use crate::observability::init_tracing;
    pub use crate::pipeline::{Orchestrator, OrchestratorBuilder, PipelineRun};
    pub use crate::resources::{FixedResourceProbe, ProcResourceProbe, ResourceProbe};
    pub use crate::stages::{
        BlockingHandler, CooperativeHandler, ExecutionMode, FanOutReport, StageContext,
        StageDescriptor, StageHandler, StageResult, StageStatus, StageTolerance,
    };
    pub use crate::timeout::{TimeoutRecord, TimeoutWarning};
    pub use crate::tolerance::TolerancePolicy;
}
