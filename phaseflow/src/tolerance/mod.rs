//! Error tolerance for stages made of many independent sub-items.
//!
//! Sub-item failures are tallied locally and classified against a policy,
//! so a stage can succeed partially instead of aborting the run.

mod registry;
mod tracker;

pub use registry::ToleranceRegistry;
pub use tracker::{ErrorToleranceState, ErrorToleranceTracker, TolerancePolicy};
