use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::liveness::{INTERACTIVE_THRESHOLD, PASSIVE_THRESHOLD};
use crate::types::{ModelKind, SignalSet};

const DEFAULT_TARGET_FPS: u32 = 60;
const DEFAULT_LOAD_BACKOFF_MS: u64 = 250;

/// Which detection flow the controller runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperatingMode {
    /// Detect + liveness each cycle, landmark + feature on capture.
    #[default]
    Interactive,
    /// Passive flow: also computes age, gender, expression and head pose
    /// for every detected face, with a more permissive liveness threshold.
    Descriptor,
}

impl OperatingMode {
    /// Models that must finish loading before the loop may start.
    pub fn required_models(&self) -> &'static [ModelKind] {
        match self {
            OperatingMode::Interactive => &[
                ModelKind::Detect,
                ModelKind::Landmark,
                ModelKind::Liveness,
                ModelKind::Feature,
            ],
            OperatingMode::Descriptor => &ModelKind::ALL,
        }
    }

    pub fn default_threshold(&self) -> f32 {
        match self {
            OperatingMode::Interactive => INTERACTIVE_THRESHOLD,
            OperatingMode::Descriptor => PASSIVE_THRESHOLD,
        }
    }

    pub fn signals(&self) -> SignalSet {
        match self {
            OperatingMode::Interactive => SignalSet::NONE,
            OperatingMode::Descriptor => SignalSet::ALL,
        }
    }
}

/// The knobs a detection cycle is parametrized by.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CycleProfile {
    pub liveness_threshold: f32,
    pub signals: SignalSet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FacingMode {
    #[default]
    User,
    Environment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResizeMode {
    None,
    #[default]
    CropAndScale,
}

/// Camera acquisition request.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConstraints {
    pub facing_mode: FacingMode,
    pub resize_mode: ResizeMode,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

/// Controller configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub mode: OperatingMode,
    /// Detection ticks per second.
    pub target_fps: u32,
    /// Overrides the mode's default liveness threshold.
    pub liveness_threshold: Option<f32>,
    pub camera: CameraConstraints,
    /// Flip frames horizontally when repainting the frame buffer.
    pub mirror: bool,
    /// Per-call inference deadline. Unset means calls may take arbitrarily long.
    pub inference_timeout_ms: Option<u64>,
    /// Extra attempts for a rejected model load. Zero disables retry.
    pub model_load_retries: u32,
    /// Delay before the first retry; doubles on each further attempt.
    pub model_load_backoff_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            mode: OperatingMode::default(),
            target_fps: DEFAULT_TARGET_FPS,
            liveness_threshold: None,
            camera: CameraConstraints::default(),
            mirror: false,
            inference_timeout_ms: None,
            model_load_retries: 0,
            model_load_backoff_ms: DEFAULT_LOAD_BACKOFF_MS,
        }
    }
}

impl PipelineConfig {
    pub fn for_mode(mode: OperatingMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.target_fps == 0 {
            return Err(ConfigError::ZeroFrameRate);
        }
        let threshold = self.threshold();
        if !(0.0..=1.0).contains(&threshold) {
            return Err(ConfigError::ThresholdOutOfRange(threshold));
        }
        if self.camera.width == Some(0) {
            return Err(ConfigError::ZeroDimension("width"));
        }
        if self.camera.height == Some(0) {
            return Err(ConfigError::ZeroDimension("height"));
        }
        Ok(())
    }

    pub fn threshold(&self) -> f32 {
        self.liveness_threshold
            .unwrap_or_else(|| self.mode.default_threshold())
    }

    pub fn profile(&self) -> CycleProfile {
        CycleProfile {
            liveness_threshold: self.threshold(),
            signals: self.mode.signals(),
        }
    }

    pub fn tick_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.target_fps.max(1)))
    }

    pub fn inference_timeout(&self) -> Option<Duration> {
        self.inference_timeout_ms.map(Duration::from_millis)
    }

    pub fn load_retry(&self) -> RetryPolicy {
        RetryPolicy {
            retries: self.model_load_retries,
            backoff: Duration::from_millis(self.model_load_backoff_ms),
        }
    }
}

/// Bounded retry with exponential backoff for model loads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retries: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub const NONE: RetryPolicy = RetryPolicy {
        retries: 0,
        backoff: Duration::ZERO,
    };

    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.backoff.saturating_mul(factor)
    }
}
