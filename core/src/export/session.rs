//! Offline export: audio file in, video file out.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, TryRecvError};

use crate::audio::{load_audio, AudioData, BeamFrame, PointShaper, DEFAULT_POINT_RATE};
use crate::config::RecordingSettings;
use crate::gpu::{CapturedFrame, Readiness, RenderThread, RowOrder};

use super::toolchain::{FrameWriter, Toolchain};
use super::{ExportError, ExportOutcome, ExportPhase, ExportSummary, FramePlan};

/// Interval between renderer readiness polls.
pub const READY_POLL: Duration = Duration::from_millis(100);

/// Readiness polls before giving up.
pub const READY_ATTEMPTS: u32 = 80;

/// How long one frame may take on the render thread.
pub const RENDER_TIMEOUT: Duration = Duration::from_secs(10);

/// Share of the progress bar spent rendering; the rest covers muxing.
const RENDER_SHARE: f64 = 0.9;

/// The render side of an export.
pub trait ExportRenderer: Send {
    /// Wait up to `timeout` for the renderer to come up.
    fn poll_ready(&mut self, timeout: Duration) -> Readiness;

    /// Fix the output size and frame interval for the whole export.
    fn begin(&mut self, resolution: u32, frame_rate: f64) -> Result<(), ExportError>;

    /// Render one frame and return its pixels.
    fn render(&mut self, frame: BeamFrame) -> Result<CapturedFrame, ExportError>;

    /// Release anything `begin` pinned.
    fn end(&mut self);
}

impl ExportRenderer for RenderThread {
    fn poll_ready(&mut self, timeout: Duration) -> Readiness {
        RenderThread::poll_ready(self, timeout)
    }

    fn begin(&mut self, resolution: u32, frame_rate: f64) -> Result<(), ExportError> {
        let client = self.client();
        client.parameters().set_frame_rate(frame_rate as f32);
        client
            .lock_resolution(Some(resolution))
            .map_err(|e| ExportError::Render(e.to_string()))
    }

    fn render(&mut self, frame: BeamFrame) -> Result<CapturedFrame, ExportError> {
        self.client()
            .render(frame, RENDER_TIMEOUT)
            .map_err(|e| ExportError::Render(e.to_string()))
    }

    fn end(&mut self) {
        let _ = self.client().lock_resolution(None);
    }
}

/// What to export.
#[derive(Debug, Clone)]
pub struct ExportRequest {
    pub input: PathBuf,
    pub destination: PathBuf,
    pub settings: RecordingSettings,
    /// Beam points per second of audio.
    pub point_rate: f64,
}

impl ExportRequest {
    pub fn new(input: impl Into<PathBuf>, destination: impl Into<PathBuf>, settings: RecordingSettings) -> Self {
        Self {
            input: input.into(),
            destination: destination.into(),
            settings,
            point_rate: DEFAULT_POINT_RATE,
        }
    }

    fn destination_dir(&self) -> &Path {
        match self.destination.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        }
    }
}

#[derive(Default)]
struct SessionState {
    /// Whole percent, 0..=100.
    progress: AtomicU32,
    phase: AtomicU8,
    cancel: AtomicBool,
}

impl SessionState {
    fn set_progress(&self, fraction: f64) {
        let percent = (fraction.clamp(0.0, 1.0) * 100.0).floor() as u32;
        self.progress.fetch_max(percent, Ordering::AcqRel);
    }

    fn set_phase(&self, phase: ExportPhase) {
        let previous = self.phase.fetch_max(phase as u8, Ordering::AcqRel);
        if previous < phase as u8 {
            log::info!("Export phase: {phase}");
        }
    }

    fn check_cancel(&self) -> Result<(), ExportError> {
        if self.cancel.load(Ordering::Acquire) {
            Err(ExportError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// A running export. Dropping the handle cancels the export and waits for
/// it to unwind.
pub struct ExportHandle {
    state: Arc<SessionState>,
    outcome_rx: Receiver<ExportOutcome>,
    outcome: Option<ExportOutcome>,
    thread: Option<JoinHandle<()>>,
}

impl ExportHandle {
    /// Fraction complete in 0..=1. Never decreases.
    pub fn progress(&self) -> f64 {
        self.state.progress.load(Ordering::Acquire) as f64 / 100.0
    }

    pub fn state(&self) -> ExportPhase {
        ExportPhase::from_u8(self.state.phase.load(Ordering::Acquire))
    }

    /// Ask the export to stop. It unwinds at its next check and reports
    /// [`ExportOutcome::Cancelled`].
    pub fn cancel(&self) {
        self.state.cancel.store(true, Ordering::Release);
    }

    /// The outcome, once the export has finished.
    pub fn try_outcome(&mut self) -> Option<&ExportOutcome> {
        if self.outcome.is_none() {
            match self.outcome_rx.try_recv() {
                Ok(outcome) => {
                    self.join();
                    self.outcome = Some(outcome);
                }
                Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Disconnected) => {
                    self.join();
                    self.outcome = Some(panicked());
                }
            }
        }
        self.outcome.as_ref()
    }

    /// Block until the export finishes.
    pub fn wait(mut self) -> ExportOutcome {
        if let Some(outcome) = self.outcome.take() {
            return outcome;
        }
        let outcome = self.outcome_rx.recv().unwrap_or_else(|_| panicked());
        self.join();
        outcome
    }

    fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("Export thread panicked");
            }
        }
    }
}

impl Drop for ExportHandle {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.cancel();
            self.join();
        }
    }
}

fn panicked() -> ExportOutcome {
    ExportOutcome::Failed(ExportError::Io(io::Error::other("export thread panicked")))
}

/// Drives one export from start to finish on its own thread.
pub struct ExportSession<R, T> {
    request: ExportRequest,
    renderer: R,
    toolchain: T,
    state: Arc<SessionState>,
}

impl<R, T> ExportSession<R, T>
where
    R: ExportRenderer + 'static,
    T: Toolchain + 'static,
{
    /// Start exporting on a new thread.
    pub fn start(request: ExportRequest, renderer: R, toolchain: T) -> io::Result<ExportHandle> {
        let state = Arc::new(SessionState::default());
        let (outcome_tx, outcome_rx) = channel::bounded(1);
        let mut session = ExportSession {
            request,
            renderer,
            toolchain,
            state: Arc::clone(&state),
        };

        let thread = thread::Builder::new()
            .name("export".to_string())
            .spawn(move || {
                let outcome = ExportOutcome::from(session.run());
                drop(session);
                log::info!("{outcome}");
                let _ = outcome_tx.send(outcome);
            })?;

        Ok(ExportHandle {
            state,
            outcome_rx,
            outcome: None,
            thread: Some(thread),
        })
    }

    fn run(&mut self) -> Result<ExportSummary, ExportError> {
        self.request.settings.validate()?;
        let destination_dir = self.request.destination_dir().to_path_buf();
        if !destination_dir.is_dir() {
            return Err(ExportError::Configuration(format!(
                "destination directory {} does not exist",
                destination_dir.display()
            )));
        }

        self.state.set_phase(ExportPhase::WaitingForRenderer);
        self.wait_for_renderer()?;

        self.state.set_phase(ExportPhase::Decoding);
        self.state.check_cancel()?;
        let audio = load_audio(&self.request.input)?;
        let plan = FramePlan::new(
            audio.sample_rate,
            audio.num_frames(),
            self.request.settings.frame_rate,
        );
        log::info!(
            "Exporting {:.2}s of audio as {} frames ({} samples per frame)",
            audio.duration(),
            plan.frame_count,
            plan.samples_per_frame
        );

        let settings = &self.request.settings;
        self.renderer.begin(settings.resolution, settings.frame_rate)?;
        let result = self.encode(&audio, plan, &destination_dir);
        self.renderer.end();
        result
    }

    fn wait_for_renderer(&mut self) -> Result<(), ExportError> {
        for _ in 0..READY_ATTEMPTS {
            self.state.check_cancel()?;
            match self.renderer.poll_ready(READY_POLL) {
                Readiness::Ready(adapter) => {
                    log::debug!("Renderer ready on {adapter}");
                    return Ok(());
                }
                Readiness::Failed(message) => return Err(ExportError::Render(message)),
                Readiness::Pending => {}
            }
        }
        Err(ExportError::RendererTimeout(READY_POLL * READY_ATTEMPTS))
    }

    fn encode(
        &mut self,
        audio: &AudioData,
        plan: FramePlan,
        destination_dir: &Path,
    ) -> Result<ExportSummary, ExportError> {
        let settings = self.request.settings.clone();
        let extension = settings.extension();
        let scratch = tempfile::Builder::new()
            .prefix("phosphor-export-")
            .tempdir()?;
        let video_path = scratch.path().join(format!("video.{extension}"));

        self.state.set_phase(ExportPhase::Rendering);
        let mut writer = self.toolchain.start_encoder(
            &settings,
            settings.resolution,
            settings.resolution,
            &video_path,
        )?;
        let frames = match self.render_frames(audio, plan, writer.as_mut()) {
            Ok(frames) => frames,
            Err(e) => {
                writer.cancel();
                return Err(e);
            }
        };
        writer.finish()?;
        self.state.check_cancel()?;

        let staged = tempfile::Builder::new()
            .prefix(".phosphor-")
            .suffix(&format!(".{extension}"))
            .tempfile_in(destination_dir)?;
        if settings.record_audio {
            self.state.set_phase(ExportPhase::Muxing);
            self.toolchain.mux(
                &video_path,
                &self.request.input,
                staged.path(),
                &self.state.cancel,
            )?;
        } else {
            fs::copy(&video_path, staged.path())?;
        }
        self.state.check_cancel()?;

        self.state.set_phase(ExportPhase::Finalizing);
        staged
            .persist(&self.request.destination)
            .map_err(|e| ExportError::Io(e.error))?;

        self.state.set_progress(1.0);
        self.state.set_phase(ExportPhase::Done);
        Ok(ExportSummary {
            destination: self.request.destination.clone(),
            frames,
            duration: frames as f64 / settings.frame_rate,
            with_audio: settings.record_audio,
        })
    }

    fn render_frames(
        &mut self,
        audio: &AudioData,
        plan: FramePlan,
        writer: &mut dyn FrameWriter,
    ) -> Result<usize, ExportError> {
        let resolution = self.request.settings.resolution;
        let expected_len = CapturedFrame::byte_len(resolution, resolution);
        let mut shaper = PointShaper::new(
            audio.channels,
            audio.sample_rate as f64,
            self.request.point_rate,
        );
        let mut chunks = audio.chunks(plan.samples_per_frame);
        let mut rendered = 0;

        while let Some(chunk) = chunks.next_chunk() {
            self.state.check_cancel()?;
            let frame = shaper.shape_frame(chunk);
            let captured = self.renderer.render(frame)?.into_row_order(RowOrder::TopDown);
            if captured.pixels.len() != expected_len {
                return Err(ExportError::Render(format!(
                    "frame {rendered} is {}x{}, expected {resolution}x{resolution}",
                    captured.width, captured.height
                )));
            }
            writer.write_frame(&captured.pixels)?;
            rendered += 1;
            self.state
                .set_progress(RENDER_SHARE * rendered as f64 / plan.frame_count as f64);
        }
        Ok(rendered)
    }
}
