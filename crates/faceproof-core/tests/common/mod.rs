#![allow(dead_code, unused_imports)]

mod fakes;
pub use fakes::*;

pub use faceproof_core::{
    spawn_controller, BoundingBox, CameraError, CaptureError, ControllerHandle, FaceDescriptor,
    InferenceError, ModelKind, OperatingMode, PipelineConfig, PipelineError, PipelineSnapshot,
    PipelineState, PipelineStatus, StillImageSource,
};

use std::time::Duration;

/// Wait (in virtual time) until the published snapshot satisfies `pred`.
pub async fn wait_until(
    handle: &ControllerHandle,
    pred: impl FnMut(&PipelineSnapshot) -> bool,
) -> PipelineSnapshot {
    let mut rx = handle.watch();
    let snapshot = tokio::time::timeout(Duration::from_secs(10), rx.wait_for(pred))
        .await
        .expect("condition not reached within 10s")
        .expect("controller exited")
        .clone();
    snapshot
}

pub fn face_box() -> BoundingBox {
    BoundingBox::new(16.0, 8.0, 48.0, 40.0)
}
