//! Controller state machine.
//!
//! `Pipeline` holds every piece of mutable controller state and decides
//! which transitions are legal. It performs no I/O: the async driver in
//! [`controller`](crate::controller) feeds it completions and acts on what
//! it returns.
//!
//! Staleness is tracked with a generation counter. Every async operation is
//! tagged with the generation it started under; teardown and terminal
//! faults bump the generation, so anything that resolves afterwards is
//! rejected with [`StaleCompletion`] before it can touch state. Detection
//! cycles carry an additional cycle id so only the single in-flight cycle
//! may complete.

use serde::Serialize;

use crate::config::{CycleProfile, OperatingMode};
use crate::error::{CameraError, CaptureError, InferenceError, PipelineError, StaleCompletion};
use crate::liveness::{classify, classify_all, strongest, LivenessScore, Verdict};
use crate::types::{BoundingBox, DetectionReport, FaceDescriptor, ModelKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PipelineState {
    Idle,
    AcquiringCamera,
    LoadingModels,
    Ready,
    Running,
    Capturing,
    Stopped,
}

impl PipelineState {
    /// Running or capturing: the loop is armed.
    pub fn is_live(&self) -> bool {
        matches!(self, PipelineState::Running | PipelineState::Capturing)
    }
}

/// Readiness flags. All false at construction; each flips to true once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct PipelineStatus {
    #[serde(rename = "camera-ready")]
    pub camera_ready: bool,
    pub detect: bool,
    pub landmark: bool,
    pub liveness: bool,
    pub feature: bool,
    pub pose: bool,
}

impl PipelineStatus {
    pub fn model(&self, kind: ModelKind) -> bool {
        match kind {
            ModelKind::Detect => self.detect,
            ModelKind::Landmark => self.landmark,
            ModelKind::Liveness => self.liveness,
            ModelKind::Feature => self.feature,
            ModelKind::Pose => self.pose,
        }
    }

    /// Returns whether the flag changed.
    fn mark_model(&mut self, kind: ModelKind) -> bool {
        let slot = match kind {
            ModelKind::Detect => &mut self.detect,
            ModelKind::Landmark => &mut self.landmark,
            ModelKind::Liveness => &mut self.liveness,
            ModelKind::Feature => &mut self.feature,
            ModelKind::Pose => &mut self.pose,
        };
        let changed = !*slot;
        *slot = true;
        changed
    }

    pub fn satisfies(&self, required: &[ModelKind]) -> bool {
        self.camera_ready && required.iter().all(|kind| self.model(*kind))
    }
}

/// Permission to run one detection cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleTicket {
    generation: u64,
    cycle: u64,
}

impl CycleTicket {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn cycle(&self) -> u64 {
        self.cycle
    }
}

/// Permission to run a capture against the last live detection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CaptureTicket {
    generation: u64,
    face: BoundingBox,
}

impl CaptureTicket {
    pub fn face(&self) -> BoundingBox {
        self.face
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// What the detect -> liveness chain produced for one frame.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    NoFace,
    Face {
        frame_index: u64,
        face: BoundingBox,
        scores: Vec<LivenessScore>,
        descriptor: Option<FaceDescriptor>,
    },
    Failed(InferenceError),
}

/// Point-in-time copy of the controller state, published to observers.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSnapshot {
    pub state: PipelineState,
    pub mode: OperatingMode,
    pub status: PipelineStatus,
    pub generation: u64,
    pub last_live: Option<BoundingBox>,
    pub last_report: Option<DetectionReport>,
    pub fault: Option<PipelineError>,
    pub cycles_completed: u64,
    pub cycles_failed: u64,
    pub ticks_skipped: u64,
    pub stale_discarded: u64,
}

pub struct Pipeline {
    state: PipelineState,
    mode: OperatingMode,
    profile: CycleProfile,
    status: PipelineStatus,
    generation: u64,
    next_cycle: u64,
    in_flight: Option<u64>,
    last_live: Option<BoundingBox>,
    last_report: Option<DetectionReport>,
    fault: Option<PipelineError>,
    cycles_completed: u64,
    cycles_failed: u64,
    ticks_skipped: u64,
    stale_discarded: u64,
}

impl Pipeline {
    pub fn new(mode: OperatingMode, profile: CycleProfile) -> Self {
        Self {
            state: PipelineState::Idle,
            mode,
            profile,
            status: PipelineStatus::default(),
            generation: 0,
            next_cycle: 0,
            in_flight: None,
            last_live: None,
            last_report: None,
            fault: None,
            cycles_completed: 0,
            cycles_failed: 0,
            ticks_skipped: 0,
            stale_discarded: 0,
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn status(&self) -> PipelineStatus {
        self.status
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn profile(&self) -> CycleProfile {
        self.profile
    }

    pub fn required_models(&self) -> &'static [ModelKind] {
        self.mode.required_models()
    }

    pub fn last_live(&self) -> Option<BoundingBox> {
        self.last_live
    }

    pub fn fault(&self) -> Option<&PipelineError> {
        self.fault.as_ref()
    }

    /// Idle -> AcquiringCamera. Returns the generation the startup runs under.
    pub fn start(&mut self) -> u64 {
        if self.state == PipelineState::Idle {
            self.state = PipelineState::AcquiringCamera;
            tracing::debug!(generation = self.generation, "acquiring camera");
        }
        self.generation
    }

    pub fn camera_acquired(&mut self, generation: u64) -> Result<(), StaleCompletion> {
        self.accept(generation, &[PipelineState::AcquiringCamera])?;
        self.status.camera_ready = true;
        self.state = PipelineState::LoadingModels;
        Ok(())
    }

    pub fn camera_failed(
        &mut self,
        generation: u64,
        err: CameraError,
    ) -> Result<(), StaleCompletion> {
        self.accept(generation, &[PipelineState::AcquiringCamera])?;
        self.fail(PipelineError::CameraUnavailable(err));
        Ok(())
    }

    /// Record one model load. Returns `true` exactly once: on the completion
    /// that makes every required entry true, regardless of arrival order.
    pub fn model_loaded(
        &mut self,
        generation: u64,
        kind: ModelKind,
    ) -> Result<bool, StaleCompletion> {
        self.accept(generation, &[PipelineState::LoadingModels])?;
        if !self.status.mark_model(kind) {
            tracing::debug!(model = %kind, "duplicate model load ignored");
            return Ok(false);
        }
        if self.status.satisfies(self.mode.required_models()) {
            self.state = PipelineState::Ready;
            tracing::info!(mode = ?self.mode, "all models loaded; pipeline ready");
            return Ok(true);
        }
        Ok(false)
    }

    pub fn model_failed(
        &mut self,
        generation: u64,
        kind: ModelKind,
        err: InferenceError,
    ) -> Result<(), StaleCompletion> {
        self.accept(generation, &[PipelineState::LoadingModels])?;
        self.fail(PipelineError::ModelLoadFailure {
            model: kind,
            source: err,
        });
        Ok(())
    }

    /// Terminal failure of the driver itself.
    pub fn fail_internal(&mut self, message: impl Into<String>) {
        if self.state != PipelineState::Stopped {
            self.fail(PipelineError::Internal(message.into()));
        }
    }

    /// Ready -> Running, once the periodic tick is armed.
    pub fn arm(&mut self) -> bool {
        if self.state == PipelineState::Ready {
            self.state = PipelineState::Running;
            return true;
        }
        false
    }

    /// Try to start a detection cycle on this tick. `None` means the tick is
    /// skipped: a cycle is still in flight, a capture is running, or the
    /// loop is not armed.
    pub fn begin_cycle(&mut self) -> Option<CycleTicket> {
        match self.state {
            PipelineState::Running if self.in_flight.is_none() => {
                self.next_cycle += 1;
                self.in_flight = Some(self.next_cycle);
                Some(CycleTicket {
                    generation: self.generation,
                    cycle: self.next_cycle,
                })
            }
            PipelineState::Running | PipelineState::Capturing => {
                self.ticks_skipped += 1;
                tracing::trace!(
                    in_flight = ?self.in_flight,
                    state = ?self.state,
                    "tick skipped"
                );
                None
            }
            _ => None,
        }
    }

    /// Apply a cycle's outcome. The returned report is what the overlay
    /// should paint; `None` means nothing to paint this cycle.
    pub fn complete_cycle(
        &mut self,
        ticket: CycleTicket,
        outcome: CycleOutcome,
    ) -> Result<Option<DetectionReport>, StaleCompletion> {
        self.accept(
            ticket.generation,
            &[PipelineState::Running, PipelineState::Capturing],
        )?;
        if self.in_flight != Some(ticket.cycle) {
            return Err(self.discard(ticket.generation));
        }
        self.in_flight = None;
        self.cycles_completed += 1;

        match outcome {
            CycleOutcome::NoFace => {
                self.clear_detection();
                Ok(None)
            }
            CycleOutcome::Failed(err) => {
                self.cycles_failed += 1;
                tracing::warn!(error = %err, cycle = ticket.cycle, "detection cycle failed");
                self.clear_detection();
                Ok(None)
            }
            CycleOutcome::Face {
                frame_index,
                face,
                scores,
                descriptor,
            } => {
                let threshold = self.profile.liveness_threshold;
                let best_score = strongest(&scores).map(|r| r.score);
                let verdict = best_score
                    .map(|score| classify(score, threshold))
                    .unwrap_or(Verdict::Spoof);

                self.last_live = verdict.is_live().then_some(face);
                let report = DetectionReport {
                    frame_index,
                    face,
                    faces: classify_all(&scores, threshold),
                    verdict,
                    best_score,
                    descriptor,
                };
                tracing::debug!(
                    cycle = ticket.cycle,
                    frame = frame_index,
                    score = ?best_score,
                    verdict = ?verdict,
                    "cycle complete"
                );
                self.last_report = Some(report.clone());
                Ok(Some(report))
            }
        }
    }

    /// Running -> Capturing, against the last live detection. On failure
    /// nothing changes.
    pub fn begin_capture(&mut self) -> Result<CaptureTicket, CaptureError> {
        match self.state {
            PipelineState::Running => {}
            PipelineState::Capturing => return Err(CaptureError::InProgress),
            other => return Err(CaptureError::NotRunning(other)),
        }
        let face = self.last_live.ok_or(CaptureError::NoFaceDetected)?;
        self.state = PipelineState::Capturing;
        Ok(CaptureTicket {
            generation: self.generation,
            face,
        })
    }

    /// Capturing -> Running.
    pub fn finish_capture(&mut self, ticket: CaptureTicket) -> Result<(), StaleCompletion> {
        self.accept(ticket.generation, &[PipelineState::Capturing])?;
        self.state = PipelineState::Running;
        Ok(())
    }

    /// Any -> Stopped. Resets readiness and detection state; everything
    /// started before this call becomes stale.
    pub fn teardown(&mut self) {
        if self.state == PipelineState::Stopped {
            return;
        }
        self.generation += 1;
        self.state = PipelineState::Stopped;
        self.status = PipelineStatus::default();
        self.in_flight = None;
        self.clear_detection();
        tracing::info!(generation = self.generation, "pipeline torn down");
    }

    pub fn snapshot(&self) -> PipelineSnapshot {
        PipelineSnapshot {
            state: self.state,
            mode: self.mode,
            status: self.status,
            generation: self.generation,
            last_live: self.last_live,
            last_report: self.last_report.clone(),
            fault: self.fault.clone(),
            cycles_completed: self.cycles_completed,
            cycles_failed: self.cycles_failed,
            ticks_skipped: self.ticks_skipped,
            stale_discarded: self.stale_discarded,
        }
    }

    fn fail(&mut self, err: PipelineError) {
        tracing::error!(error = %err, "pipeline stopped");
        self.generation += 1;
        self.state = PipelineState::Stopped;
        self.in_flight = None;
        self.clear_detection();
        self.fault = Some(err);
    }

    fn clear_detection(&mut self) {
        self.last_live = None;
        self.last_report = None;
    }

    fn accept(
        &mut self,
        generation: u64,
        expected: &[PipelineState],
    ) -> Result<(), StaleCompletion> {
        if generation != self.generation || !expected.contains(&self.state) {
            return Err(self.discard(generation));
        }
        Ok(())
    }

    fn discard(&mut self, generation: u64) -> StaleCompletion {
        self.stale_discarded += 1;
        tracing::trace!(
            generation,
            current = self.generation,
            state = ?self.state,
            "stale completion discarded"
        );
        StaleCompletion {
            generation,
            current: self.generation,
        }
    }
}
