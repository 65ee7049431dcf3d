use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use faceproof_core::{OperatingMode, PipelineConfig};
use serde::{Deserialize, Serialize};

/// CLI configuration: an optional TOML file, then `FACEPROOF_*` overrides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub pipeline: PipelineConfig,
    pub source: SourceConfig,
    pub simulation: SimulationConfig,
}

/// Where frames come from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Replay this image instead of the synthetic camera.
    pub image: Option<PathBuf>,
    /// Synthetic camera resolution when no constraint is given.
    pub synthetic_width: u32,
    pub synthetic_height: u32,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            image: None,
            synthetic_width: 320,
            synthetic_height: 240,
        }
    }
}

/// Behaviour of the simulated inference backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// RNG seed for reproducible liveness scores. Unset seeds from entropy.
    pub seed: Option<u64>,
    /// Mean liveness score reported for a detected face.
    pub liveness: f32,
    /// Uniform noise added to each score.
    pub jitter: f32,
    pub load_delay_ms: u64,
    pub inference_delay_ms: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            seed: None,
            liveness: 0.8,
            jitter: 0.1,
            load_delay_ms: 150,
            inference_delay_ms: 5,
        }
    }
}

impl Config {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("invalid config {}", path.display()))
    }

    /// Apply `FACEPROOF_*` overrides. Unparseable values are ignored.
    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(mode) = var("FACEPROOF_MODE").and_then(|v| parse_mode(&v)) {
            self.pipeline.mode = mode;
        }
        if let Some(fps) = env_parse(&var, "FACEPROOF_TARGET_FPS") {
            self.pipeline.target_fps = fps;
        }
        if let Some(threshold) = env_parse(&var, "FACEPROOF_LIVENESS_THRESHOLD") {
            self.pipeline.liveness_threshold = Some(threshold);
        }
        if let Some(width) = env_parse(&var, "FACEPROOF_FRAME_WIDTH") {
            self.pipeline.camera.width = Some(width);
        }
        if let Some(height) = env_parse(&var, "FACEPROOF_FRAME_HEIGHT") {
            self.pipeline.camera.height = Some(height);
        }
        if let Some(mirror) = var("FACEPROOF_MIRROR") {
            self.pipeline.mirror = mirror != "0";
        }
        if let Some(timeout) = env_parse(&var, "FACEPROOF_INFERENCE_TIMEOUT_MS") {
            self.pipeline.inference_timeout_ms = Some(timeout);
        }
        if let Some(image) = var("FACEPROOF_IMAGE") {
            self.source.image = Some(PathBuf::from(image));
        }
        if let Some(seed) = env_parse(&var, "FACEPROOF_SEED") {
            self.simulation.seed = Some(seed);
        }
    }
}

pub fn parse_mode(value: &str) -> Option<OperatingMode> {
    match value.to_ascii_lowercase().as_str() {
        "interactive" => Some(OperatingMode::Interactive),
        "descriptor" | "passive" => Some(OperatingMode::Descriptor),
        _ => None,
    }
}

fn env_parse<T: FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    var(key).and_then(|v| v.parse().ok())
}
