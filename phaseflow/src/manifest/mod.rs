//! Final run report.
//!
//! The [`ManifestBuilder`] reduces stage results, abort state, tolerance
//! tallies and timeout records into one [`ExecutionManifest`]. A manifest is
//! produced for every run, including aborted and timed-out ones.

mod builder;

pub use builder::{ExecutionManifest, ManifestBuilder, StageSummary, ToleranceSummary};
