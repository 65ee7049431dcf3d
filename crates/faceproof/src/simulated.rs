//! Stand-ins for a real camera and real models, so the pipeline can be
//! exercised end to end without hardware or model files.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use faceproof_core::config::CameraConstraints;
use faceproof_core::types::{
    ExpressionEstimate, Gender, GenderEstimate, HeadPose, SignalSet,
};
use faceproof_core::{
    BoundingBox, CameraError, FaceDescriptor, FeatureVector, Frame, FrameGeometry, FrameSource,
    InferenceError, InferenceService, LivenessScore, ModelKind, Point,
};
use image::{Rgb, RgbImage};
use imageproc::drawing::draw_filled_circle_mut;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::SimulationConfig;

/// Pixels at or above this luma count as face.
const FACE_LUMA: u8 = 200;
const FEATURE_GRID: (u32, u32) = (16, 8);
const EXPRESSIONS: [&str; 4] = ["neutral", "happy", "surprised", "sad"];

/// A bright disc orbiting the frame centre on a dark gradient.
pub struct SyntheticCamera {
    width: u32,
    height: u32,
    started: Option<Instant>,
}

impl SyntheticCamera {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            started: None,
        }
    }

    fn render(&self, t: f32) -> RgbImage {
        let (w, h) = (self.width, self.height);
        let mut image = RgbImage::from_fn(w, h, |x, y| {
            let shade = (40 + (x * 40 / w.max(1)) + (y * 20 / h.max(1))) as u8;
            Rgb([shade, shade, shade.saturating_add(10)])
        });
        let radius = (w.min(h) / 6).max(2) as i32;
        let orbit = (w.min(h) as f32) / 5.0;
        let cx = (w as f32 / 2.0 + orbit * t.cos()) as i32;
        let cy = (h as f32 / 2.0 + orbit * (0.7 * t).sin()) as i32;
        draw_filled_circle_mut(&mut image, (cx, cy), radius, Rgb([235, 215, 190]));
        image
    }
}

#[async_trait]
impl FrameSource for SyntheticCamera {
    async fn acquire(
        &mut self,
        constraints: &CameraConstraints,
    ) -> Result<FrameGeometry, CameraError> {
        if let Some(width) = constraints.width {
            self.width = width;
        }
        if let Some(height) = constraints.height {
            self.height = height;
        }
        if self.width == 0 || self.height == 0 {
            return Err(CameraError::Unsupported("zero-sized synthetic camera".into()));
        }
        self.started = Some(Instant::now());
        tracing::info!(width = self.width, height = self.height, "synthetic camera started");
        Ok(FrameGeometry {
            width: self.width,
            height: self.height,
        })
    }

    fn read_frame(&self) -> Result<RgbImage, CameraError> {
        let started = self.started.ok_or(CameraError::NotReady)?;
        Ok(self.render(started.elapsed().as_secs_f32()))
    }

    fn release(&mut self) {
        if self.started.take().is_some() {
            tracing::debug!("synthetic camera released");
        }
    }
}

/// Deterministic-enough models: detection finds the bright region,
/// liveness is a configurable score plus seeded noise.
pub struct SimulatedInference {
    settings: SimulationConfig,
    rng: Mutex<StdRng>,
}

impl SimulatedInference {
    pub fn new(settings: SimulationConfig) -> Self {
        let rng = match settings.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            settings,
            rng: Mutex::new(rng),
        }
    }

    fn with_rng<T>(&self, f: impl FnOnce(&mut StdRng) -> T) -> T {
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut rng)
    }

    async fn think(&self) {
        if self.settings.inference_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.settings.inference_delay_ms)).await;
        }
    }
}

/// Bounding box of all pixels at or above [`FACE_LUMA`].
fn bright_region(image: &RgbImage) -> Option<BoundingBox> {
    let mut bounds: Option<(u32, u32, u32, u32)> = None;
    for (x, y, pixel) in image.enumerate_pixels() {
        if luma(pixel) < FACE_LUMA {
            continue;
        }
        bounds = Some(match bounds {
            None => (x, y, x, y),
            Some((l, t, r, b)) => (l.min(x), t.min(y), r.max(x), b.max(y)),
        });
    }
    bounds.map(|(l, t, r, b)| BoundingBox::new(l as f32, t as f32, (r + 1) as f32, (b + 1) as f32))
}

fn luma(pixel: &Rgb<u8>) -> u8 {
    let [r, g, b] = pixel.0;
    ((u32::from(r) * 299 + u32::from(g) * 587 + u32::from(b) * 114) / 1000) as u8
}

fn l2_normalize(values: &mut [f32]) {
    let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in values.iter_mut() {
            *v /= norm;
        }
    }
}

#[async_trait]
impl InferenceService for SimulatedInference {
    type Session = ModelKind;

    async fn load_model(&self, kind: ModelKind) -> Result<ModelKind, InferenceError> {
        tokio::time::sleep(Duration::from_millis(self.settings.load_delay_ms)).await;
        tracing::debug!(model = %kind, "simulated model ready");
        Ok(kind)
    }

    async fn detect_face(
        &self,
        _session: &ModelKind,
        frame: &Frame,
    ) -> Result<Option<BoundingBox>, InferenceError> {
        self.think().await;
        Ok(bright_region(frame.image()))
    }

    async fn predict_liveness(
        &self,
        _session: &ModelKind,
        _frame: &Frame,
        face: &BoundingBox,
    ) -> Result<Vec<LivenessScore>, InferenceError> {
        self.think().await;
        // Non-finite jitter means no noise.
        let jitter = self.settings.jitter.abs();
        let noise = if jitter.is_finite() && jitter > 0.0 {
            self.with_rng(|rng| rng.gen_range(-jitter..=jitter))
        } else {
            0.0
        };
        let base = if self.settings.liveness.is_finite() {
            self.settings.liveness
        } else {
            0.0
        };
        let score = (base + noise).clamp(0.0, 1.0);
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
        _session: &ModelKind,
        _frame: &Frame,
        face: &BoundingBox,
    ) -> Result<Vec<Point>, InferenceError> {
        self.think().await;
        let (w, h) = (face.width(), face.height());
        // Eyes, nose tip, mouth corners.
        Ok([(0.3, 0.38), (0.7, 0.38), (0.5, 0.58), (0.34, 0.78), (0.66, 0.78)]
            .iter()
            .map(|(fx, fy)| Point::new(face.left + w * fx, face.top + h * fy))
            .collect())
    }

    async fn extract_feature(
        &self,
        _session: &ModelKind,
        frame: &Frame,
        landmarks: &[Point],
    ) -> Result<FeatureVector, InferenceError> {
        self.think().await;
        if landmarks.is_empty() {
            return Err(InferenceError::rejected("extract_feature", "no landmarks"));
        }
        let (min_x, max_x) = landmarks
            .iter()
            .fold((f32::MAX, f32::MIN), |(lo, hi), p| (lo.min(p.x), hi.max(p.x)));
        let (min_y, max_y) = landmarks
            .iter()
            .fold((f32::MAX, f32::MIN), |(lo, hi), p| (lo.min(p.y), hi.max(p.y)));

        let image = frame.image();
        let (cols, rows) = FEATURE_GRID;
        let span_x = (max_x - min_x).max(1.0);
        let span_y = (max_y - min_y).max(1.0);
        let mut values = Vec::with_capacity((cols * rows) as usize);
        for row in 0..rows {
            for col in 0..cols {
                let x = min_x + span_x * (col as f32 + 0.5) / cols as f32;
                let y = min_y + span_y * (row as f32 + 0.5) / rows as f32;
                let x = (x.max(0.0) as u32).min(image.width().saturating_sub(1));
                let y = (y.max(0.0) as u32).min(image.height().saturating_sub(1));
                let sample = image
                    .get_pixel_checked(x, y)
                    .map(|p| f32::from(luma(p)) / 255.0)
                    .unwrap_or(0.0);
                values.push(sample + 1e-3);
            }
        }
        l2_normalize(&mut values);
        FeatureVector::new(values)
    }

    async fn describe_face(
        &self,
        _session: &ModelKind,
        frame: &Frame,
        face: &BoundingBox,
        signals: SignalSet,
    ) -> Result<FaceDescriptor, InferenceError> {
        self.think().await;
        let mut descriptor = FaceDescriptor::default();
        self.with_rng(|rng| {
            if signals.demographics {
                descriptor.gender = Some(GenderEstimate {
                    gender: if rng.gen_bool(0.5) {
                        Gender::Female
                    } else {
                        Gender::Male
                    },
                    probability: rng.gen_range(0.6..=0.99),
                });
                descriptor.age = Some(rng.gen_range(18.0..=65.0));
            }
            if signals.expression {
                descriptor.expression = Some(ExpressionEstimate {
                    label: EXPRESSIONS[rng.gen_range(0..EXPRESSIONS.len())].to_string(),
                    probability: rng.gen_range(0.5..=0.99),
                });
            }
        });
        if signals.head_pose {
            // Offset from the frame centre stands in for head rotation.
            let center = face.center();
            let half_w = frame.width().max(1) as f32 / 2.0;
            let half_h = frame.height().max(1) as f32 / 2.0;
            descriptor.pose = Some(HeadPose {
                yaw: (center.x - half_w) / half_w * 30.0,
                pitch: (center.y - half_h) / half_h * 20.0,
                roll: 0.0,
            });
        }
        Ok(descriptor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn settings(liveness: f32) -> SimulationConfig {
        SimulationConfig {
            seed: Some(11),
            liveness,
            jitter: 0.0,
            load_delay_ms: 0,
            inference_delay_ms: 0,
        }
    }

    async fn acquired(width: u32, height: u32) -> SyntheticCamera {
        let mut camera = SyntheticCamera::new(width, height);
        camera.acquire(&CameraConstraints::default()).await.unwrap();
        camera
    }

    #[tokio::test]
    async fn test_camera_not_ready_until_acquired() {
        let camera = SyntheticCamera::new(64, 48);
        assert_eq!(camera.read_frame().unwrap_err(), CameraError::NotReady);

        let mut camera = acquired(64, 48).await;
        assert_eq!(camera.read_frame().unwrap().dimensions(), (64, 48));
        camera.release();
        assert_eq!(camera.read_frame().unwrap_err(), CameraError::NotReady);
    }

    #[tokio::test]
    async fn test_constraints_override_resolution() {
        let mut camera = SyntheticCamera::new(320, 240);
        let constraints = CameraConstraints {
            width: Some(160),
            height: Some(120),
            ..CameraConstraints::default()
        };
        let geometry = camera.acquire(&constraints).await.unwrap();
        assert_eq!((geometry.width, geometry.height), (160, 120));
    }

    #[tokio::test]
    async fn test_detects_the_synthetic_face() {
        let camera = acquired(160, 120).await;
        let frame = Frame::new(camera.render(0.0), 1);
        let inference = SimulatedInference::new(settings(0.8));

        let face = inference
            .detect_face(&ModelKind::Detect, &frame)
            .await
            .unwrap()
            .expect("face");
        // Radius 20 disc centred at (80 + 24, 60).
        assert!((face.center().x - 104.0).abs() <= 1.5, "{face:?}");
        assert!((face.center().y - 60.0).abs() <= 1.5, "{face:?}");
        assert!((face.width() - 41.0).abs() <= 2.0, "{face:?}");
    }

    #[tokio::test]
    async fn test_dark_frame_has_no_face() {
        let frame = Frame::new(RgbImage::from_pixel(32, 32, Rgb([30, 30, 30])), 1);
        let inference = SimulatedInference::new(settings(0.8));
        assert!(inference
            .detect_face(&ModelKind::Detect, &frame)
            .await
            .unwrap()
            .is_none());
    }

    #[rstest]
    #[case(0.8, 0.8)]
    #[case(1.5, 1.0)]
    #[case(-0.2, 0.0)]
    #[tokio::test]
    async fn test_liveness_score_is_clamped(#[case] configured: f32, #[case] expected: f32) {
        let inference = SimulatedInference::new(settings(configured));
        let frame = Frame::new(RgbImage::new(8, 8), 1);
        let face = BoundingBox::new(1.0, 1.0, 6.0, 6.0);
        let scores = inference
            .predict_liveness(&ModelKind::Liveness, &frame, &face)
            .await
            .unwrap();
        assert_eq!(scores.len(), 1);
        assert_eq!(scores[0].score, expected);
        assert_eq!(scores[0].bounds(), face);
    }

    #[rstest]
    #[case(f32::NAN, 0.6)]
    #[case(f32::INFINITY, 0.6)]
    #[case(0.0, f32::NAN)]
    #[tokio::test]
    async fn test_non_finite_settings_do_not_panic(#[case] jitter: f32, #[case] liveness: f32) {
        let config = SimulationConfig {
            jitter,
            ..settings(liveness)
        };
        let inference = SimulatedInference::new(config);
        let frame = Frame::new(RgbImage::new(8, 8), 1);
        let face = BoundingBox::new(1.0, 1.0, 6.0, 6.0);
        let scores = inference
            .predict_liveness(&ModelKind::Liveness, &frame, &face)
            .await
            .unwrap();
        assert!((0.0..=1.0).contains(&scores[0].score));
    }

    #[tokio::test]
    async fn test_seeded_jitter_is_reproducible() {
        let config = SimulationConfig {
            jitter: 0.2,
            ..settings(0.5)
        };
        let frame = Frame::new(RgbImage::new(8, 8), 1);
        let face = BoundingBox::new(1.0, 1.0, 6.0, 6.0);

        let mut runs = Vec::new();
        for _ in 0..2 {
            let inference = SimulatedInference::new(config.clone());
            let mut scores = Vec::new();
            for _ in 0..5 {
                let s = inference
                    .predict_liveness(&ModelKind::Liveness, &frame, &face)
                    .await
                    .unwrap();
                assert!((0.3..=0.7).contains(&s[0].score));
                scores.push(s[0].score);
            }
            runs.push(scores);
        }
        assert_eq!(runs[0], runs[1]);
    }

    #[tokio::test]
    async fn test_feature_is_unit_length() {
        let camera = acquired(160, 120).await;
        let frame = Frame::new(camera.render(1.0), 1);
        let inference = SimulatedInference::new(settings(0.8));
        let face = bright_region(frame.image()).unwrap();

        let landmarks = inference
            .predict_landmark(&ModelKind::Landmark, &frame, &face)
            .await
            .unwrap();
        assert_eq!(landmarks.len(), 5);

        let feature = inference
            .extract_feature(&ModelKind::Feature, &frame, &landmarks)
            .await
            .unwrap();
        assert_eq!(feature.len(), 128);
        let norm: f32 = feature.values().iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[tokio::test]
    async fn test_feature_needs_landmarks() {
        let inference = SimulatedInference::new(settings(0.8));
        let frame = Frame::new(RgbImage::new(8, 8), 1);
        let err = inference
            .extract_feature(&ModelKind::Feature, &frame, &[])
            .await
            .unwrap_err();
        assert!(matches!(err, InferenceError::Rejected { .. }));
    }

    #[tokio::test]
    async fn test_descriptor_honours_signals() {
        let inference = SimulatedInference::new(settings(0.8));
        let frame = Frame::new(RgbImage::new(100, 100), 1);
        let face = BoundingBox::new(60.0, 40.0, 80.0, 60.0);

        let all = inference
            .describe_face(&ModelKind::Pose, &frame, &face, SignalSet::ALL)
            .await
            .unwrap();
        assert!(all.gender.is_some() && all.age.is_some() && all.expression.is_some());
        let pose = all.pose.unwrap();
        assert!((pose.yaw - 12.0).abs() < 1e-3);
        assert!(pose.pitch.abs() < 1e-3);

        let pose_only = SignalSet {
            head_pose: true,
            ..SignalSet::NONE
        };
        let partial = inference
            .describe_face(&ModelKind::Pose, &frame, &face, pose_only)
            .await
            .unwrap();
        assert!(partial.gender.is_none() && partial.expression.is_none());
        assert!(partial.pose.is_some());
    }
}
