use std::future::pending;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use faceproof_core::{
    spawn_controller, BoundingBox, CaptureError, CaptureResult, ControllerHandle, DetectionReport,
    FeatureVector, OperatingMode, PipelineError, PipelineSnapshot, PipelineState, Point,
    StillImageSource,
};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

mod config;
mod simulated;

use config::Config;
use simulated::{SimulatedInference, SyntheticCamera};

#[derive(Parser)]
#[command(name = "faceproof", version, about = "Face detection and liveness pipeline")]
struct Cli {
    /// TOML configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Replay an image file instead of the synthetic camera.
    #[arg(long, global = true)]
    image: Option<PathBuf>,

    #[arg(long, global = true, value_enum)]
    mode: Option<ModeArg>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Interactive,
    Descriptor,
}

impl From<ModeArg> for OperatingMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Interactive => OperatingMode::Interactive,
            ModeArg::Descriptor => OperatingMode::Descriptor,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Run the detection loop and print one JSON line per cycle
    Run {
        /// Stop after this many seconds (default: until Ctrl-C)
        #[arg(long)]
        seconds: Option<u64>,
    },
    /// Wait for a live face, capture it and print the result as JSON
    Capture {
        /// Write the captured PNG here
        #[arg(long)]
        output: Option<PathBuf>,
        #[arg(long, default_value_t = 10)]
        timeout_secs: u64,
    },
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(image) = cli.image {
        config.source.image = Some(image);
    }
    if let Some(mode) = cli.mode {
        config.pipeline.mode = mode.into();
    }

    match cli.command {
        Command::Run { seconds } => run(&config, seconds.map(Duration::from_secs)).await,
        Command::Capture {
            output,
            timeout_secs,
        } => capture(&config, output, Duration::from_secs(timeout_secs)).await,
        Command::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn start(config: &Config) -> Result<ControllerHandle> {
    let inference = SimulatedInference::new(config.simulation.clone());
    let handle = match &config.source.image {
        Some(path) => {
            tracing::info!(path = %path.display(), "replaying still image");
            spawn_controller(
                config.pipeline.clone(),
                inference,
                StillImageSource::from_path(path),
            )
        }
        None => spawn_controller(
            config.pipeline.clone(),
            inference,
            SyntheticCamera::new(config.source.synthetic_width, config.source.synthetic_height),
        ),
    };
    handle.context("invalid pipeline configuration")
}

#[derive(Serialize)]
struct CycleLine<'a> {
    cycle: u64,
    state: PipelineState,
    live: bool,
    report: Option<&'a DetectionReport>,
}

async fn run(config: &Config, limit: Option<Duration>) -> Result<()> {
    let handle = start(config)?;
    handle
        .wait_ready()
        .await
        .context("pipeline failed to start")?;
    tracing::info!(mode = ?config.pipeline.mode, "pipeline running");

    let deadline = async {
        match limit {
            Some(limit) => tokio::time::sleep(limit).await,
            None => pending().await,
        }
    };
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(deadline, ctrl_c);

    let mut updates = handle.watch();
    let mut printed = 0;
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            _ = &mut ctrl_c => break,
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = updates.borrow_and_update().clone();
                if snapshot.cycles_completed == printed {
                    continue;
                }
                printed = snapshot.cycles_completed;
                print_cycle(&snapshot)?;
            }
        }
    }

    handle.shutdown().await;
    let snapshot = handle.snapshot();
    tracing::info!(
        cycles = snapshot.cycles_completed,
        failed = snapshot.cycles_failed,
        skipped = snapshot.ticks_skipped,
        stale = snapshot.stale_discarded,
        "pipeline stopped"
    );
    Ok(())
}

fn print_cycle(snapshot: &PipelineSnapshot) -> Result<()> {
    let line = CycleLine {
        cycle: snapshot.cycles_completed,
        state: snapshot.state,
        live: snapshot.last_live.is_some(),
        report: snapshot.last_report.as_ref(),
    };
    println!("{}", serde_json::to_string(&line)?);
    Ok(())
}

#[derive(Serialize)]
struct CaptureSummary<'a> {
    id: String,
    captured_at: String,
    face: BoundingBox,
    landmarks: &'a [Point],
    feature: &'a FeatureVector,
    image: ImageSummary,
}

#[derive(Serialize)]
struct ImageSummary {
    mime_type: &'static str,
    width: u32,
    height: u32,
    bytes: usize,
    path: Option<PathBuf>,
}

async fn capture(config: &Config, output: Option<PathBuf>, timeout: Duration) -> Result<()> {
    let handle = start(config)?;
    let attempt = tokio::time::timeout(timeout, capture_live_face(&handle)).await;
    handle.shutdown().await;
    let result = attempt.context("timed out waiting for a live face")??;

    if let Some(path) = &output {
        std::fs::write(path, &result.image.bytes)
            .with_context(|| format!("failed to write {}", path.display()))?;
    }

    let summary = CaptureSummary {
        id: result.id.to_string(),
        captured_at: result.captured_at.to_rfc3339(),
        face: result.face,
        landmarks: &result.landmarks,
        feature: &result.feature,
        image: ImageSummary {
            mime_type: result.image.format.mime_type(),
            width: result.image.width,
            height: result.image.height,
            bytes: result.image.bytes.len(),
            path: output,
        },
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

/// Wait for a live detection and capture it. A detection that turns
/// stale before the capture lands is waited for again.
async fn capture_live_face(handle: &ControllerHandle) -> Result<CaptureResult> {
    handle
        .wait_ready()
        .await
        .context("pipeline failed to start")?;
    let mut updates = handle.watch();
    loop {
        updates
            .wait_for(|s| s.last_live.is_some() || s.state == PipelineState::Stopped)
            .await
            .map_err(|_| PipelineError::ControllerGone)?;
        match handle.capture().await {
            Ok(result) => return Ok(result),
            Err(CaptureError::NoFaceDetected) => {
                tracing::debug!("live face lost before capture, waiting again");
            }
            Err(err) => return Err(err).context("capture failed"),
        }
    }
}
