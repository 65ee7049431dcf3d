use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::InferenceError;
use crate::liveness::{ClassifiedFace, Verdict};

/// Face rectangle in frame-pixel space.
///
/// Produced by detection and consumed by liveness and landmark prediction.
/// A new detection always yields a new box; boxes are never adjusted in place.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BoundingBox {
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
}

impl BoundingBox {
    /// Build a box from two corners, normalizing so that `left <= right`
    /// and `top <= bottom`.
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self {
            left: x1.min(x2),
            top: y1.min(y2),
            right: x1.max(x2),
            bottom: y1.max(y2),
        }
    }

    pub fn width(&self) -> f32 {
        self.right - self.left
    }

    pub fn height(&self) -> f32 {
        self.bottom - self.top
    }

    pub fn center(&self) -> Point {
        Point {
            x: (self.left + self.right) / 2.0,
            y: (self.top + self.bottom) / 2.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// Face embedding produced by the feature model.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct FeatureVector(Vec<f32>);

impl FeatureVector {
    /// Wrap raw model output, rejecting empty vectors and NaN/Inf values.
    pub fn new(values: Vec<f32>) -> Result<Self, InferenceError> {
        if values.is_empty() {
            return Err(InferenceError::InvalidFeature("empty vector".to_string()));
        }
        if let Some(idx) = values.iter().position(|v| !v.is_finite()) {
            return Err(InferenceError::InvalidFeature(format!(
                "non-finite value at index {idx}"
            )));
        }
        Ok(Self(values))
    }

    pub fn values(&self) -> &[f32] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// The inference models the pipeline can load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    Detect,
    Landmark,
    Liveness,
    Feature,
    Pose,
}

impl ModelKind {
    pub const ALL: [ModelKind; 5] = [
        ModelKind::Detect,
        ModelKind::Landmark,
        ModelKind::Liveness,
        ModelKind::Feature,
        ModelKind::Pose,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelKind::Detect => "detect",
            ModelKind::Landmark => "landmark",
            ModelKind::Liveness => "liveness",
            ModelKind::Feature => "feature",
            ModelKind::Pose => "pose",
        }
    }

    fn index(&self) -> usize {
        match self {
            ModelKind::Detect => 0,
            ModelKind::Landmark => 1,
            ModelKind::Liveness => 2,
            ModelKind::Feature => 3,
            ModelKind::Pose => 4,
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Loaded session handles, one slot per [`ModelKind`].
///
/// Filled while models load, then frozen behind an `Arc` once the pipeline
/// is ready. Handles are only ever passed by reference into inference calls.
pub struct SessionSet<S> {
    slots: [Option<S>; 5],
}

impl<S> SessionSet<S> {
    pub fn new() -> Self {
        Self {
            slots: [None, None, None, None, None],
        }
    }

    pub fn insert(&mut self, kind: ModelKind, session: S) {
        self.slots[kind.index()] = Some(session);
    }

    pub fn get(&self, kind: ModelKind) -> Result<&S, InferenceError> {
        self.slots[kind.index()]
            .as_ref()
            .ok_or(InferenceError::MissingSession(kind))
    }
}

impl<S> Default for SessionSet<S> {
    fn default() -> Self {
        Self::new()
    }
}

/// Auxiliary per-face signals computed alongside liveness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct SignalSet {
    pub demographics: bool,
    pub expression: bool,
    pub head_pose: bool,
}

impl SignalSet {
    pub const NONE: SignalSet = SignalSet {
        demographics: false,
        expression: false,
        head_pose: false,
    };

    pub const ALL: SignalSet = SignalSet {
        demographics: true,
        expression: true,
        head_pose: true,
    };

    pub fn is_empty(&self) -> bool {
        !(self.demographics || self.expression || self.head_pose)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Female,
    Male,
}

impl fmt::Display for Gender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Gender::Female => f.write_str("female"),
            Gender::Male => f.write_str("male"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GenderEstimate {
    pub gender: Gender,
    pub probability: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExpressionEstimate {
    pub label: String,
    pub probability: f32,
}

/// Head orientation in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct HeadPose {
    pub yaw: f32,
    pub pitch: f32,
    pub roll: f32,
}

/// Per-face auxiliary labels. Fields are `None` when the signal was not
/// requested or the model could not produce it.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct FaceDescriptor {
    pub gender: Option<GenderEstimate>,
    pub age: Option<f32>,
    pub expression: Option<ExpressionEstimate>,
    pub pose: Option<HeadPose>,
}

/// Everything one detection cycle produced, handed to the overlay renderer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionReport {
    pub frame_index: u64,
    pub face: BoundingBox,
    pub faces: Vec<ClassifiedFace>,
    pub verdict: Verdict,
    pub best_score: Option<f32>,
    pub descriptor: Option<FaceDescriptor>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BlobFormat {
    Png,
}

impl BlobFormat {
    pub fn mime_type(&self) -> &'static str {
        match self {
            BlobFormat::Png => "image/png",
        }
    }
}

/// Encoded still image of the frame buffer at capture time.
#[derive(Clone, PartialEq)]
pub struct ImageBlob {
    pub format: BlobFormat,
    pub width: u32,
    pub height: u32,
    pub bytes: Vec<u8>,
}

impl fmt::Debug for ImageBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageBlob")
            .field("format", &self.format)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.bytes.len())
            .finish()
    }
}

/// Result of a capture. Ownership passes to the caller.
#[derive(Debug, Clone)]
pub struct CaptureResult {
    pub id: Uuid,
    pub captured_at: DateTime<Utc>,
    pub image: ImageBlob,
    pub feature: FeatureVector,
    /// The last live detection the capture was computed from.
    pub face: BoundingBox,
    pub landmarks: Vec<Point>,
}
