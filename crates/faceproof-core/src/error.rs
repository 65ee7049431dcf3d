use std::time::Duration;

use thiserror::Error;

use crate::pipeline::PipelineState;
use crate::types::ModelKind;

/// Frame source failures. Acquisition failures are terminal for the attempt.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CameraError {
    #[error("camera permission denied: {0}")]
    PermissionDenied(String),
    #[error("camera not available: {0}")]
    DeviceUnavailable(String),
    #[error("camera access not supported: {0}")]
    Unsupported(String),
    #[error("camera has not produced a frame yet")]
    NotReady,
}

/// Failures reported by the inference service.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InferenceError {
    #[error("{op} rejected: {message}")]
    Rejected { op: &'static str, message: String },
    #[error("{op} timed out after {after:?}")]
    TimedOut { op: &'static str, after: Duration },
    #[error("no {0} session loaded")]
    MissingSession(ModelKind),
    #[error("invalid feature vector: {0}")]
    InvalidFeature(String),
    #[error("inference task aborted")]
    Aborted,
}

impl InferenceError {
    pub fn rejected(op: &'static str, message: impl Into<String>) -> Self {
        InferenceError::Rejected {
            op,
            message: message.into(),
        }
    }
}

/// Terminal pipeline faults, surfaced to the operator.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PipelineError {
    #[error("camera unavailable: {0}")]
    CameraUnavailable(#[from] CameraError),
    #[error("failed to load {model} model: {source}")]
    ModelLoadFailure {
        model: ModelKind,
        #[source]
        source: InferenceError,
    },
    #[error("controller task failed: {0}")]
    Internal(String),
    #[error("pipeline stopped before it became ready")]
    Stopped,
    #[error("controller has exited")]
    ControllerGone,
}

/// Failures returned to the caller of a capture request.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CaptureError {
    #[error("no live face detected")]
    NoFaceDetected,
    #[error("a capture is already in progress")]
    InProgress,
    #[error("pipeline is not running (state: {0:?})")]
    NotRunning(PipelineState),
    #[error("capture inference failed: {0}")]
    Inference(#[from] InferenceError),
    #[error("failed to encode capture image: {0}")]
    Encode(String),
    #[error("capture cancelled by teardown")]
    Cancelled,
    #[error("controller has exited")]
    ControllerGone,
}

/// An async completion that arrived after teardown or after it was
/// superseded. Always discarded, never surfaced past the controller.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("stale completion (generation {generation}, current {current})")]
pub struct StaleCompletion {
    pub generation: u64,
    pub current: u64,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("target_fps must be greater than zero")]
    ZeroFrameRate,
    #[error("liveness threshold {0} is outside [0, 1]")]
    ThresholdOutOfRange(f32),
    #[error("frame {0} must be greater than zero")]
    ZeroDimension(&'static str),
}
