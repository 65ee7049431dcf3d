//! The detection loop controller.
//!
//! One task owns the [`Pipeline`], the frame source and the frame buffer.
//! Callers talk to it through a cloneable [`ControllerHandle`]: captures
//! and shutdown go over an mpsc queue with a oneshot reply, and state is
//! published on watch channels so observers never block the loop.
//!
//! Inference runs in spawned tasks. The controller joins them in its
//! select loop and feeds their results back through the pipeline, which
//! rejects anything that completes after teardown.

use std::future::pending;
use std::sync::Arc;

use image::RgbaImage;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::PipelineConfig;
use crate::cycle::{load_with_retry, run_capture, run_cycle};
use crate::error::{CameraError, CaptureError, ConfigError, InferenceError, PipelineError};
use crate::frame::{Frame, FrameBuffer};
use crate::inference::InferenceService;
use crate::overlay::render_overlay;
use crate::pipeline::{
    CaptureTicket, CycleOutcome, CycleTicket, Pipeline, PipelineSnapshot, PipelineState,
};
use crate::source::FrameSource;
use crate::types::{CaptureResult, SessionSet};

const COMMAND_QUEUE: usize = 8;

type CaptureReply = oneshot::Sender<Result<CaptureResult, CaptureError>>;

enum Command {
    Capture { reply: CaptureReply },
    Shutdown { done: oneshot::Sender<()> },
}

/// Clone-safe handle to the controller task.
#[derive(Clone)]
pub struct ControllerHandle {
    commands: mpsc::Sender<Command>,
    snapshot: watch::Receiver<PipelineSnapshot>,
    video: watch::Receiver<Option<Arc<Frame>>>,
    overlay: watch::Receiver<RgbaImage>,
}

impl ControllerHandle {
    /// Request an enrollment capture from the last live detection.
    pub async fn capture(&self) -> Result<CaptureResult, CaptureError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Capture { reply })
            .await
            .map_err(|_| CaptureError::ControllerGone)?;
        rx.await.map_err(|_| CaptureError::ControllerGone)?
    }

    /// Tear the pipeline down and wait until the camera is released.
    /// Returns immediately if the controller has already exited.
    pub async fn shutdown(&self) {
        let (done, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown { done }).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Wait until the detection loop is running, or the pipeline stops.
    pub async fn wait_ready(&self) -> Result<(), PipelineError> {
        let mut rx = self.snapshot.clone();
        let snapshot = rx
            .wait_for(|s| s.state.is_live() || s.state == PipelineState::Stopped)
            .await
            .map_err(|_| PipelineError::ControllerGone)?
            .clone();
        if snapshot.state == PipelineState::Stopped {
            return Err(snapshot.fault.unwrap_or(PipelineError::Stopped));
        }
        Ok(())
    }

    pub fn snapshot(&self) -> PipelineSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<PipelineSnapshot> {
        self.snapshot.clone()
    }

    /// Video passthrough: the frame most recently painted into the buffer.
    pub fn video_surface(&self) -> watch::Receiver<Option<Arc<Frame>>> {
        self.video.clone()
    }

    /// Overlay drawn over the video, sized to the acquired frame geometry.
    pub fn overlay_surface(&self) -> watch::Receiver<RgbaImage> {
        self.overlay.clone()
    }
}

/// Validate `config` and spawn the controller on the current runtime.
///
/// Startup (camera acquisition, then concurrent model loads) begins
/// immediately; use [`ControllerHandle::wait_ready`] to wait for it.
pub fn spawn_controller<I, S>(
    config: PipelineConfig,
    inference: I,
    source: S,
) -> Result<ControllerHandle, ConfigError>
where
    I: InferenceService,
    S: FrameSource,
{
    config.validate()?;

    let pipeline = Pipeline::new(config.mode, config.profile());
    let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE);
    let (snapshot_tx, snapshot_rx) = watch::channel(pipeline.snapshot());
    let (video_tx, video_rx) = watch::channel(None);
    let (overlay_tx, overlay_rx) = watch::channel(RgbaImage::new(0, 0));

    let controller = Controller {
        buffer: FrameBuffer::new(config.mirror, video_tx),
        config,
        pipeline,
        inference: Arc::new(inference),
        source,
        commands: commands_rx,
        snapshot_tx,
        overlay_tx,
    };
    tokio::spawn(controller.run());

    Ok(ControllerHandle {
        commands: commands_tx,
        snapshot: snapshot_rx,
        video: video_rx,
        overlay: overlay_rx,
    })
}

/// A shutdown request, or the last handle going away.
struct StopRequest {
    done: Option<oneshot::Sender<()>>,
}

impl StopRequest {
    fn acknowledge(self) {
        if let Some(done) = self.done {
            let _ = done.send(());
        }
    }
}

/// Why a phase ended without handing over to the next one.
enum Halt {
    Stop(StopRequest),
    /// The pipeline recorded a terminal fault.
    Fault,
}

/// Answer a command outside the running phase. Captures are rejected;
/// anything else means stop.
fn reject_or_stop(state: PipelineState, command: Option<Command>) -> Option<StopRequest> {
    match command {
        Some(Command::Capture { reply }) => {
            let _ = reply.send(Err(CaptureError::NotRunning(state)));
            None
        }
        Some(Command::Shutdown { done }) => Some(StopRequest { done: Some(done) }),
        None => Some(StopRequest { done: None }),
    }
}

struct CycleTask {
    ticket: CycleTicket,
    task: JoinHandle<CycleOutcome>,
}

struct CaptureTask {
    ticket: CaptureTicket,
    task: JoinHandle<Result<CaptureResult, CaptureError>>,
    reply: CaptureReply,
}

/// Join the task in `slot`, or never resolve if the slot is empty.
async fn join_slot<T>(slot: Option<&mut JoinHandle<T>>) -> Result<T, JoinError> {
    match slot {
        Some(handle) => handle.await,
        None => pending().await,
    }
}

fn join_failure(err: JoinError) -> InferenceError {
    if err.is_cancelled() {
        InferenceError::Aborted
    } else {
        InferenceError::rejected("inference task", err.to_string())
    }
}

/// Smoothed rate of completed cycles.
#[derive(Default)]
struct FpsMeter {
    last: Option<Instant>,
    rate: Option<f32>,
}

impl FpsMeter {
    fn record(&mut self, now: Instant) -> Option<f32> {
        if let Some(last) = self.last.replace(now) {
            let elapsed = now.duration_since(last).as_secs_f32();
            if elapsed > 0.0 {
                let current = 1.0 / elapsed;
                self.rate = Some(match self.rate {
                    Some(rate) => rate * 0.9 + current * 0.1,
                    None => current,
                });
            }
        }
        self.rate
    }
}

struct Controller<I: InferenceService, S: FrameSource> {
    config: PipelineConfig,
    pipeline: Pipeline,
    inference: Arc<I>,
    source: S,
    buffer: FrameBuffer,
    commands: mpsc::Receiver<Command>,
    snapshot_tx: watch::Sender<PipelineSnapshot>,
    overlay_tx: watch::Sender<RgbaImage>,
}

impl<I: InferenceService, S: FrameSource> Controller<I, S> {
    async fn run(mut self) {
        tracing::info!(mode = ?self.config.mode, fps = self.config.target_fps, "controller started");
        let generation = self.pipeline.start();
        self.publish();

        let halt = match self.startup(generation).await {
            Ok(sessions) => self.run_loop(Arc::new(sessions)).await,
            Err(halt) => halt,
        };

        self.teardown();
        match halt {
            Halt::Stop(request) => request.acknowledge(),
            Halt::Fault => self.idle_until_shutdown().await,
        }
        tracing::info!("controller exiting");
    }

    async fn startup(&mut self, generation: u64) -> Result<SessionSet<I::Session>, Halt> {
        self.acquire_camera(generation).await?;
        self.load_models(generation).await
    }

    async fn acquire_camera(&mut self, generation: u64) -> Result<(), Halt> {
        let constraints = self.config.camera.clone();
        let acquired = {
            let acquire = self.source.acquire(&constraints);
            tokio::pin!(acquire);
            loop {
                tokio::select! {
                    result = &mut acquire => break result,
                    command = self.commands.recv() => {
                        if let Some(stop) = reject_or_stop(self.pipeline.state(), command) {
                            return Err(Halt::Stop(stop));
                        }
                    }
                }
            }
        };

        let acquired = acquired.and_then(|geometry| {
            if geometry.width == 0 || geometry.height == 0 {
                return Err(CameraError::Unsupported(format!(
                    "empty frame geometry {}x{}",
                    geometry.width, geometry.height
                )));
            }
            Ok(geometry)
        });

        match acquired {
            Ok(geometry) => {
                if let Err(stale) = self.pipeline.camera_acquired(generation) {
                    tracing::debug!(%stale, "camera acquisition discarded");
                }
                tracing::info!(
                    width = geometry.width,
                    height = geometry.height,
                    "camera acquired"
                );
                self.overlay_tx
                    .send_replace(RgbaImage::new(geometry.width, geometry.height));
                self.publish();
                Ok(())
            }
            Err(err) => {
                tracing::error!(error = %err, "camera acquisition failed");
                if let Err(stale) = self.pipeline.camera_failed(generation, err) {
                    tracing::debug!(%stale, "camera failure discarded");
                }
                self.publish();
                Err(Halt::Fault)
            }
        }
    }

    /// Load every required model concurrently; readiness is decided by the
    /// pipeline as completions arrive.
    async fn load_models(&mut self, generation: u64) -> Result<SessionSet<I::Session>, Halt> {
        let policy = self.config.load_retry();
        let mut loads = JoinSet::new();
        for &kind in self.pipeline.required_models() {
            let inference = Arc::clone(&self.inference);
            loads.spawn(async move { (kind, load_with_retry(inference, kind, policy).await) });
        }
        tracing::debug!(count = loads.len(), "model loads started");

        let mut sessions = SessionSet::new();
        loop {
            tokio::select! {
                joined = loads.join_next() => {
                    let Some(joined) = joined else {
                        break;
                    };
                    match joined {
                        Ok((kind, Ok(session))) => {
                            sessions.insert(kind, session);
                            match self.pipeline.model_loaded(generation, kind) {
                                Ok(true) => {
                                    self.publish();
                                    return Ok(sessions);
                                }
                                Ok(false) => self.publish(),
                                Err(stale) => tracing::debug!(%stale, model = %kind, "model load discarded"),
                            }
                        }
                        Ok((kind, Err(err))) => {
                            loads.abort_all();
                            if let Err(stale) = self.pipeline.model_failed(generation, kind, err) {
                                tracing::debug!(%stale, model = %kind, "model failure discarded");
                            }
                            self.publish();
                            return Err(Halt::Fault);
                        }
                        Err(err) => {
                            loads.abort_all();
                            self.pipeline.fail_internal(format!("model load task failed: {err}"));
                            self.publish();
                            return Err(Halt::Fault);
                        }
                    }
                }
                command = self.commands.recv() => {
                    if let Some(stop) = reject_or_stop(self.pipeline.state(), command) {
                        loads.abort_all();
                        return Err(Halt::Stop(stop));
                    }
                }
            }
        }

        self.pipeline
            .fail_internal("model loads finished without reaching ready");
        self.publish();
        Err(Halt::Fault)
    }

    async fn run_loop(&mut self, sessions: Arc<SessionSet<I::Session>>) -> Halt {
        self.pipeline.arm();
        self.publish();

        let mut ticker = tokio::time::interval(self.config.tick_period());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut fps = FpsMeter::default();
        let mut cycle: Option<CycleTask> = None;
        let mut capture: Option<CaptureTask> = None;
        tracing::info!(period = ?self.config.tick_period(), "detection loop armed");

        let halt = loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Some(ticket) = self.pipeline.begin_cycle() {
                        cycle = self.spawn_cycle(ticket, &sessions, &mut fps);
                    }
                }
                joined = join_slot(cycle.as_mut().map(|c| &mut c.task)) => {
                    if let Some(done) = cycle.take() {
                        let outcome = joined.unwrap_or_else(|e| CycleOutcome::Failed(join_failure(e)));
                        self.finish_cycle(done.ticket, outcome, &mut fps);
                    }
                }
                joined = join_slot(capture.as_mut().map(|c| &mut c.task)) => {
                    if let Some(done) = capture.take() {
                        let result = joined.unwrap_or_else(|e| Err(CaptureError::Inference(join_failure(e))));
                        self.finish_capture(done, result);
                    }
                }
                command = self.commands.recv() => match command {
                    Some(Command::Capture { reply }) => {
                        // A refused request must not displace the running capture.
                        if let Some(task) = self.spawn_capture(reply, &sessions) {
                            capture = Some(task);
                        }
                    }
                    Some(Command::Shutdown { done }) => break Halt::Stop(StopRequest { done: Some(done) }),
                    None => break Halt::Stop(StopRequest { done: None }),
                },
            }
        };

        if let Some(abandoned) = cycle.take() {
            abandoned.task.abort();
        }
        if let Some(abandoned) = capture.take() {
            abandoned.task.abort();
            let _ = abandoned.reply.send(Err(CaptureError::Cancelled));
        }
        halt
    }

    fn spawn_cycle(
        &mut self,
        ticket: CycleTicket,
        sessions: &Arc<SessionSet<I::Session>>,
        fps: &mut FpsMeter,
    ) -> Option<CycleTask> {
        let frame = match self.buffer.repaint(&self.source) {
            Ok(frame) => frame,
            Err(err) => {
                let failure = InferenceError::rejected("read_frame", err.to_string());
                self.finish_cycle(ticket, CycleOutcome::Failed(failure), fps);
                return None;
            }
        };
        let task = tokio::spawn(run_cycle(
            Arc::clone(&self.inference),
            Arc::clone(sessions),
            frame,
            self.pipeline.profile(),
            self.config.inference_timeout(),
        ));
        Some(CycleTask { ticket, task })
    }

    fn finish_cycle(&mut self, ticket: CycleTicket, outcome: CycleOutcome, fps: &mut FpsMeter) {
        match self.pipeline.complete_cycle(ticket, outcome) {
            Ok(report) => {
                let rate = fps.record(Instant::now());
                self.overlay_tx
                    .send_modify(|surface| render_overlay(surface, report.as_ref(), rate));
                self.publish();
            }
            Err(stale) => tracing::debug!(%stale, "cycle result discarded"),
        }
    }

    fn spawn_capture(
        &mut self,
        reply: CaptureReply,
        sessions: &Arc<SessionSet<I::Session>>,
    ) -> Option<CaptureTask> {
        let ticket = match self.pipeline.begin_capture() {
            Ok(ticket) => ticket,
            Err(err) => {
                tracing::info!(error = %err, "capture rejected");
                let _ = reply.send(Err(err));
                return None;
            }
        };
        let Some(frame) = self.buffer.current() else {
            let _ = self.pipeline.finish_capture(ticket);
            let _ = reply.send(Err(CaptureError::NoFaceDetected));
            return None;
        };
        tracing::info!(face = ?ticket.face(), frame = frame.index(), "capture started");
        self.publish();

        let task = tokio::spawn(run_capture(
            Arc::clone(&self.inference),
            Arc::clone(sessions),
            frame,
            ticket.face(),
            self.config.inference_timeout(),
        ));
        Some(CaptureTask {
            ticket,
            task,
            reply,
        })
    }

    fn finish_capture(
        &mut self,
        done: CaptureTask,
        result: Result<CaptureResult, CaptureError>,
    ) {
        let result = match self.pipeline.finish_capture(done.ticket) {
            Ok(()) => result,
            Err(stale) => {
                tracing::debug!(%stale, "capture result discarded");
                Err(CaptureError::Cancelled)
            }
        };
        match &result {
            Ok(capture) => tracing::info!(
                id = %capture.id,
                feature_len = capture.feature.len(),
                "capture complete"
            ),
            Err(err) => tracing::warn!(error = %err, "capture failed"),
        }
        self.publish();
        let _ = done.reply.send(result);
    }

    fn teardown(&mut self) {
        self.pipeline.teardown();
        self.source.release();
        tracing::debug!(frames = self.buffer.painted(), "frame buffer cleared");
        self.buffer.clear();
        self.overlay_tx.send_modify(|surface| render_overlay(surface, None, None));
        self.publish();
    }

    async fn idle_until_shutdown(&mut self) {
        while let Some(command) = self.commands.recv().await {
            if let Some(stop) = reject_or_stop(self.pipeline.state(), Some(command)) {
                stop.acknowledge();
                return;
            }
        }
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(self.pipeline.snapshot());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_fps_meter_first_sample_has_no_rate() {
        let mut meter = FpsMeter::default();
        assert!(meter.record(Instant::now()).is_none());
    }

    #[test]
    fn test_fps_meter_converges() {
        let mut meter = FpsMeter::default();
        let start = Instant::now();
        let mut rate = None;
        for i in 0..50 {
            rate = meter.record(start + Duration::from_millis(50 * i));
        }
        let rate = rate.unwrap();
        assert!((rate - 20.0).abs() < 0.5, "rate {rate}");
    }

    #[test]
    fn test_reject_or_stop() {
        let (reply, mut rx) = oneshot::channel();
        assert!(reject_or_stop(
            PipelineState::LoadingModels,
            Some(Command::Capture { reply })
        )
        .is_none());
        assert_eq!(
            rx.try_recv().unwrap().unwrap_err(),
            CaptureError::NotRunning(PipelineState::LoadingModels)
        );

        let (done, _rx) = oneshot::channel();
        let stop = reject_or_stop(PipelineState::Stopped, Some(Command::Shutdown { done }));
        assert!(stop.and_then(|s| s.done).is_some());
        assert!(reject_or_stop(PipelineState::Stopped, None).is_some());
    }
}
