//! Real-time face detection and liveness pipeline.
//!
//! A [`controller`] task acquires a [`FrameSource`], loads the inference
//! models it needs concurrently, then runs a fixed-rate detection loop:
//! detect a face, score it for liveness, remember the last live box. A
//! capture request reuses that box for landmark and feature extraction and
//! returns the frame as a PNG alongside the feature vector.

pub mod config;
pub mod controller;
pub mod cycle;
pub mod error;
pub mod frame;
pub mod glyphs;
pub mod inference;
pub mod liveness;
pub mod overlay;
pub mod pipeline;
pub mod source;
pub mod types;

pub use config::{CameraConstraints, OperatingMode, PipelineConfig};
pub use controller::{spawn_controller, ControllerHandle};
pub use error::{CameraError, CaptureError, ConfigError, InferenceError, PipelineError};
pub use frame::{Frame, FrameGeometry};
pub use inference::InferenceService;
pub use liveness::{LivenessScore, Verdict};
pub use pipeline::{PipelineSnapshot, PipelineState, PipelineStatus};
pub use source::{FrameSource, StillImageSource};
pub use types::{
    BoundingBox, CaptureResult, DetectionReport, FaceDescriptor, FeatureVector, ModelKind, Point,
};
