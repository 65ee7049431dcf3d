use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use image::{Rgb, RgbImage};

use faceproof_core::config::CameraConstraints;
use faceproof_core::types::SignalSet;
use faceproof_core::{
    BoundingBox, CameraError, FaceDescriptor, FeatureVector, Frame, FrameGeometry, FrameSource,
    InferenceError, InferenceService, LivenessScore, ModelKind, Point,
};

pub const CAMERA_WIDTH: u32 = 64;
pub const CAMERA_HEIGHT: u32 = 48;

/// Frame source with a scripted acquisition result.
pub struct FakeCamera {
    failure: Option<CameraError>,
    image: RgbImage,
    acquired: bool,
    releases: Arc<AtomicUsize>,
}

impl FakeCamera {
    pub fn new() -> Self {
        Self {
            failure: None,
            image: RgbImage::from_pixel(CAMERA_WIDTH, CAMERA_HEIGHT, Rgb([90, 120, 150])),
            acquired: false,
            releases: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn failing(err: CameraError) -> Self {
        Self {
            failure: Some(err),
            ..Self::new()
        }
    }

    pub fn release_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.releases)
    }
}

#[async_trait]
impl FrameSource for FakeCamera {
    async fn acquire(
        &mut self,
        _constraints: &CameraConstraints,
    ) -> Result<FrameGeometry, CameraError> {
        if let Some(err) = self.failure.clone() {
            return Err(err);
        }
        self.acquired = true;
        Ok(FrameGeometry {
            width: self.image.width(),
            height: self.image.height(),
        })
    }

    fn read_frame(&self) -> Result<RgbImage, CameraError> {
        if !self.acquired {
            return Err(CameraError::NotReady);
        }
        Ok(self.image.clone())
    }

    fn release(&mut self) {
        self.acquired = false;
        self.releases.fetch_add(1, Ordering::SeqCst);
    }
}

type DetectStep = Result<Option<BoundingBox>, InferenceError>;
type ScoreStep = Result<f32, InferenceError>;

/// Pop the next scripted step; the last one repeats forever.
fn next_step<T: Clone>(steps: &Mutex<Vec<T>>, fallback: T) -> T {
    let mut steps = steps.lock().unwrap();
    if steps.len() > 1 {
        steps.remove(0)
    } else {
        steps.first().cloned().unwrap_or(fallback)
    }
}

#[derive(Default)]
struct Script {
    detect: Mutex<Vec<DetectStep>>,
    scores: Mutex<Vec<ScoreStep>>,
    descriptor: Option<FaceDescriptor>,
    detect_delay: Duration,
    landmark_delay: Duration,
    load_delay: Duration,
    load_failures: Mutex<HashMap<ModelKind, usize>>,

    loads: AtomicUsize,
    detect_calls: AtomicUsize,
    liveness_calls: AtomicUsize,
    landmark_calls: AtomicUsize,
    feature_calls: AtomicUsize,
    describe_calls: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

/// Inference backend driven by a script. Clones share the script and
/// counters, so a test keeps one clone as a probe after handing the other
/// to the controller.
#[derive(Clone, Default)]
pub struct ScriptedInference {
    script: Arc<Script>,
}

impl ScriptedInference {
    pub fn new() -> Self {
        Self::default()
    }

    fn script_mut(&mut self) -> &mut Script {
        Arc::get_mut(&mut self.script).expect("configure the script before cloning")
    }

    /// Detection always finds `face`.
    pub fn face(mut self, face: BoundingBox) -> Self {
        self.script_mut().detect = Mutex::new(vec![Ok(Some(face))]);
        self
    }

    pub fn detect_steps(mut self, steps: Vec<DetectStep>) -> Self {
        self.script_mut().detect = Mutex::new(steps);
        self
    }

    /// One liveness record per cycle, around the detected box.
    pub fn scores(mut self, scores: &[f32]) -> Self {
        self.script_mut().scores = Mutex::new(scores.iter().map(|s| Ok(*s)).collect());
        self
    }

    pub fn descriptor(mut self, descriptor: FaceDescriptor) -> Self {
        self.script_mut().descriptor = Some(descriptor);
        self
    }

    pub fn detect_delay(mut self, delay: Duration) -> Self {
        self.script_mut().detect_delay = delay;
        self
    }

    pub fn landmark_delay(mut self, delay: Duration) -> Self {
        self.script_mut().landmark_delay = delay;
        self
    }

    pub fn load_delay(mut self, delay: Duration) -> Self {
        self.script_mut().load_delay = delay;
        self
    }

    /// Reject the first `times` loads of `kind`.
    pub fn fail_load(mut self, kind: ModelKind, times: usize) -> Self {
        self.script_mut()
            .load_failures
            .get_mut()
            .unwrap()
            .insert(kind, times);
        self
    }

    pub fn loads(&self) -> usize {
        self.script.loads.load(Ordering::SeqCst)
    }

    pub fn detect_calls(&self) -> usize {
        self.script.detect_calls.load(Ordering::SeqCst)
    }

    pub fn liveness_calls(&self) -> usize {
        self.script.liveness_calls.load(Ordering::SeqCst)
    }

    pub fn landmark_calls(&self) -> usize {
        self.script.landmark_calls.load(Ordering::SeqCst)
    }

    pub fn feature_calls(&self) -> usize {
        self.script.feature_calls.load(Ordering::SeqCst)
    }

    pub fn describe_calls(&self) -> usize {
        self.script.describe_calls.load(Ordering::SeqCst)
    }

    /// Highest number of detect/liveness calls ever running at once.
    pub fn max_concurrent(&self) -> usize {
        self.script.max_active.load(Ordering::SeqCst)
    }

    fn enter(&self) -> ActiveGuard<'_> {
        let now = self.script.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.script.max_active.fetch_max(now, Ordering::SeqCst);
        ActiveGuard(&self.script.active)
    }
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl InferenceService for ScriptedInference {
    type Session = ModelKind;

    async fn load_model(&self, kind: ModelKind) -> Result<ModelKind, InferenceError> {
        self.script.loads.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.script.load_delay).await;
        let mut failures = self.script.load_failures.lock().unwrap();
        if let Some(remaining) = failures.get_mut(&kind) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(InferenceError::rejected("load_model", format!("{kind} unavailable")));
            }
        }
        Ok(kind)
    }

    async fn detect_face(
        &self,
        session: &ModelKind,
        _frame: &Frame,
    ) -> Result<Option<BoundingBox>, InferenceError> {
        assert_eq!(*session, ModelKind::Detect);
        let _active = self.enter();
        self.script.detect_calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.script.detect_delay).await;
        next_step(&self.script.detect, Ok(None))
    }

    async fn predict_liveness(
        &self,
        session: &ModelKind,
        _frame: &Frame,
        face: &BoundingBox,
    ) -> Result<Vec<LivenessScore>, InferenceError> {
        assert_eq!(*session, ModelKind::Liveness);
        let _active = self.enter();
        self.script.liveness_calls.fetch_add(1, Ordering::SeqCst);
        let score = next_step(&self.script.scores, Ok(0.0))?;
        Ok(vec![LivenessScore::new(
            face.left,
            face.top,
            face.right,
            face.bottom,
            score,
        )])
    }

    async fn predict_landmark(
        &self,
        session: &ModelKind,
        _frame: &Frame,
        face: &BoundingBox,
    ) -> Result<Vec<Point>, InferenceError> {
        assert_eq!(*session, ModelKind::Landmark);
        self.script.landmark_calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.script.landmark_delay).await;
        let (w, h) = (face.width(), face.height());
        Ok([(0.3, 0.4), (0.7, 0.4), (0.5, 0.6), (0.35, 0.8), (0.65, 0.8)]
            .iter()
            .map(|(fx, fy)| Point::new(face.left + w * fx, face.top + h * fy))
            .collect())
    }

    async fn extract_feature(
        &self,
        session: &ModelKind,
        _frame: &Frame,
        landmarks: &[Point],
    ) -> Result<FeatureVector, InferenceError> {
        assert_eq!(*session, ModelKind::Feature);
        assert_eq!(landmarks.len(), 5);
        self.script.feature_calls.fetch_add(1, Ordering::SeqCst);
        FeatureVector::new(vec![0.25; 128])
    }

    async fn describe_face(
        &self,
        session: &ModelKind,
        _frame: &Frame,
        _face: &BoundingBox,
        _signals: SignalSet,
    ) -> Result<FaceDescriptor, InferenceError> {
        assert_eq!(*session, ModelKind::Pose);
        self.script.describe_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.script.descriptor.clone().unwrap_or_default())
    }
}
