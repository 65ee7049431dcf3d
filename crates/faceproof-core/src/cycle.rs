//! The inference chains the controller runs off its own task.
//!
//! Each function here is a self-contained future over shared, read-only
//! inputs, so the controller can spawn it and later discard the result if
//! it went stale. Nothing in this module touches pipeline state.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use crate::config::{CycleProfile, RetryPolicy};
use crate::error::{CaptureError, InferenceError};
use crate::frame::Frame;
use crate::inference::InferenceService;
use crate::pipeline::CycleOutcome;
use crate::types::{BoundingBox, CaptureResult, ModelKind, SessionSet};

/// Await `fut`, failing with `TimedOut` if a deadline is set and passes.
pub async fn bounded<T, F>(
    op: &'static str,
    timeout: Option<Duration>,
    fut: F,
) -> Result<T, InferenceError>
where
    F: Future<Output = Result<T, InferenceError>>,
{
    match timeout {
        None => fut.await,
        Some(after) => tokio::time::timeout(after, fut)
            .await
            .map_err(|_| InferenceError::TimedOut { op, after })?,
    }
}

/// One detection cycle: detect, then score liveness around the detected
/// box, then (when the profile asks for them) auxiliary face signals.
///
/// Errors never escape: a rejected call ends the cycle as
/// [`CycleOutcome::Failed`].
pub async fn run_cycle<I: InferenceService>(
    inference: Arc<I>,
    sessions: Arc<SessionSet<I::Session>>,
    frame: Arc<Frame>,
    profile: CycleProfile,
    timeout: Option<Duration>,
) -> CycleOutcome {
    match detect_and_score(inference.as_ref(), &sessions, &frame, profile, timeout).await {
        Ok(outcome) => outcome,
        Err(err) => CycleOutcome::Failed(err),
    }
}

async fn detect_and_score<I: InferenceService>(
    inference: &I,
    sessions: &SessionSet<I::Session>,
    frame: &Frame,
    profile: CycleProfile,
    timeout: Option<Duration>,
) -> Result<CycleOutcome, InferenceError> {
    let detector = sessions.get(ModelKind::Detect)?;
    let Some(face) = bounded("detect_face", timeout, inference.detect_face(detector, frame)).await?
    else {
        return Ok(CycleOutcome::NoFace);
    };

    let liveness = sessions.get(ModelKind::Liveness)?;
    let scores = bounded(
        "predict_liveness",
        timeout,
        inference.predict_liveness(liveness, frame, &face),
    )
    .await?;

    let descriptor = if profile.signals.is_empty() {
        None
    } else {
        let pose = sessions.get(ModelKind::Pose)?;
        Some(
            bounded(
                "describe_face",
                timeout,
                inference.describe_face(pose, frame, &face, profile.signals),
            )
            .await?,
        )
    };

    Ok(CycleOutcome::Face {
        frame_index: frame.index(),
        face,
        scores,
        descriptor,
    })
}

/// Capture chain: landmarks for `face`, a feature vector from those
/// landmarks, then the frame packaged as a PNG blob.
pub async fn run_capture<I: InferenceService>(
    inference: Arc<I>,
    sessions: Arc<SessionSet<I::Session>>,
    frame: Arc<Frame>,
    face: BoundingBox,
    timeout: Option<Duration>,
) -> Result<CaptureResult, CaptureError> {
    let landmark = sessions.get(ModelKind::Landmark)?;
    let landmarks = bounded(
        "predict_landmark",
        timeout,
        inference.predict_landmark(landmark, &frame, &face),
    )
    .await?;

    let extractor = sessions.get(ModelKind::Feature)?;
    let feature = bounded(
        "extract_feature",
        timeout,
        inference.extract_feature(extractor, &frame, &landmarks),
    )
    .await?;

    let encode = Arc::clone(&frame);
    let image = tokio::task::spawn_blocking(move || encode.encode_png())
        .await
        .map_err(|e| CaptureError::Encode(e.to_string()))??;

    tracing::debug!(
        frame = frame.index(),
        landmarks = landmarks.len(),
        feature_len = feature.len(),
        bytes = image.bytes.len(),
        "capture chain complete"
    );

    Ok(CaptureResult {
        id: Uuid::new_v4(),
        captured_at: Utc::now(),
        image,
        feature,
        face,
        landmarks,
    })
}

/// Load one model, retrying rejected attempts per `policy`.
pub async fn load_with_retry<I: InferenceService>(
    inference: Arc<I>,
    kind: ModelKind,
    policy: RetryPolicy,
) -> Result<I::Session, InferenceError> {
    let mut attempt = 0;
    loop {
        match inference.load_model(kind).await {
            Ok(session) => {
                tracing::info!(model = %kind, attempts = attempt + 1, "model loaded");
                return Ok(session);
            }
            Err(err) if attempt < policy.retries => {
                attempt += 1;
                let delay = policy.delay(attempt);
                tracing::warn!(
                    model = %kind,
                    attempt,
                    retries = policy.retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "model load failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}
