//! Orchestrator construction and execution.
//!
//! This module provides:
//! - A validating builder for the fixed, linear stage list
//! - The orchestrator and its explicit per-run context
//! - The run handle that executes stages and produces the manifest

mod builder;
mod orchestrator;
mod run;

pub use builder::OrchestratorBuilder;
pub use orchestrator::{Orchestrator, RunContext};
pub use run::PipelineRun;
