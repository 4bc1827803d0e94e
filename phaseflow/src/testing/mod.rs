//! Testing utilities for phaseflow orchestrators.
//!
//! This module provides:
//! - Mock handlers covering the common stage behaviours
//! - Assertions over execution manifests

mod assertions;
mod mocks;

pub use assertions::{
    assert_manifest_failed, assert_manifest_succeeded, assert_stage_order, assert_stage_status,
};
pub use mocks::{FailingHandler, GridHandler, RecordingHandler, SlowHandler, SpinningHandler};
