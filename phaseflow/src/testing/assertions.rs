//! Test assertions for execution manifests.

use crate::manifest::ExecutionManifest;
use crate::stages::StageStatus;

/// Asserts that the run succeeded.
pub fn assert_manifest_succeeded(manifest: &ExecutionManifest) {
    assert!(
        manifest.success,
        "Expected success, got stages: {:?}",
        manifest
            .stages
            .iter()
            .map(|s| (&s.stage_id, s.status, &s.error))
            .collect::<Vec<_>>()
    );
}

/// Asserts that the run did not succeed.
pub fn assert_manifest_failed(manifest: &ExecutionManifest) {
    assert!(
        !manifest.success,
        "Expected failure, but run succeeded with {} stages",
        manifest.stages_completed
    );
}

/// Asserts that a stage ended with the expected status.
pub fn assert_stage_status(manifest: &ExecutionManifest, stage_id: &str, expected: StageStatus) {
    let actual = manifest.stage(stage_id).map(|s| s.status);
    assert_eq!(
        actual,
        Some(expected),
        "Expected stage '{}' to be {:?}, got {:?}",
        stage_id,
        expected,
        actual
    );
}

/// Asserts that stages were recorded in exactly this order.
pub fn assert_stage_order(manifest: &ExecutionManifest, expected: &[&str]) {
    let actual: Vec<&str> = manifest.stages.iter().map(|s| s.stage_id.as_str()).collect();
    assert_eq!(actual, expected, "Unexpected stage order");
}
