//! Configuration surface for the orchestrator.
//!
//! Provides:
//! - The runtime mode enum controlling timeout scaling and tolerance policy
//! - Base timeout table, resource limits, instrumentation and tolerance defaults

mod mode;
mod settings;

pub use mode::{RuntimeMode, RUNTIME_MODE_ENV};
pub use settings::{
    InstrumentationConfig, OrchestratorConfig, ResourceLimits, TimeoutTable, ToleranceDefaults,
};
