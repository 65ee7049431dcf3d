use async_trait::async_trait;

use crate::error::InferenceError;
use crate::frame::Frame;
use crate::liveness::LivenessScore;
use crate::types::{BoundingBox, FaceDescriptor, FeatureVector, ModelKind, Point, SignalSet};

/// The black-box inference backend the controller drives.
///
/// Every operation is asynchronous and may reject. Sessions are opaque
/// handles returned by [`load_model`](InferenceService::load_model); the
/// controller owns them and only passes them back by reference.
#[async_trait]
pub trait InferenceService: Send + Sync + 'static {
    type Session: Send + Sync + 'static;

    /// Load one model. Loads for different kinds are independent and may
    /// run concurrently.
    async fn load_model(&self, kind: ModelKind) -> Result<Self::Session, InferenceError>;

    /// Locate the primary face in the frame, or `None` when there is none.
    async fn detect_face(
        &self,
        session: &Self::Session,
        frame: &Frame,
    ) -> Result<Option<BoundingBox>, InferenceError>;

    /// Score every face around `face` for liveness.
    async fn predict_liveness(
        &self,
        session: &Self::Session,
        frame: &Frame,
        face: &BoundingBox,
    ) -> Result<Vec<LivenessScore>, InferenceError>;

    async fn predict_landmark(
        &self,
        session: &Self::Session,
        frame: &Frame,
        face: &BoundingBox,
    ) -> Result<Vec<Point>, InferenceError>;

    async fn extract_feature(
        &self,
        session: &Self::Session,
        frame: &Frame,
        landmarks: &[Point],
    ) -> Result<FeatureVector, InferenceError>;

    /// Auxiliary labels (gender, age, expression, head pose) from the pose
    /// model. Backends without one report nothing.
    async fn describe_face(
        &self,
        _session: &Self::Session,
        _frame: &Frame,
        _face: &BoundingBox,
        _signals: SignalSet,
    ) -> Result<FaceDescriptor, InferenceError> {
        Ok(FaceDescriptor::default())
    }
}
