//! Recording the live display.
//!
//! A [`LiveRecording`] attaches a [`CaptureSink`] to the render thread and
//! feeds every captured frame to an encoder from its own thread, while an
//! optional [`WavCapture`] records the audio stream next to it. Stopping
//! runs the same mux and replace steps as an offline export.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{Receiver, RecvTimeoutError};
use tempfile::TempDir;

use crate::audio::{SampleBus, WavCapture};
use crate::config::RecordingSettings;
use crate::gpu::{CaptureSink, CapturedFrame, RenderClient};

use super::toolchain::{FrameWriter, Toolchain};
use super::{ExportError, ExportOutcome, ExportSummary};

/// Captured frames that may wait for the encoder thread.
const CAPTURE_QUEUE: usize = 4;

const POLL: Duration = Duration::from_millis(50);

/// Audio source for a recording: the bus to tap and its sample rate.
pub struct AudioTap<'a> {
    pub bus: &'a SampleBus,
    pub sample_rate: u32,
}

#[derive(Default)]
struct RecorderState {
    stop: AtomicBool,
    cancel: AtomicBool,
    failed: AtomicBool,
    frames: AtomicU64,
    skipped: AtomicU64,
}

type RecorderResult = Result<(Box<dyn FrameWriter>, u64), ExportError>;

/// A recording in progress.
pub struct LiveRecording {
    client: RenderClient,
    toolchain: Box<dyn Toolchain>,
    settings: RecordingSettings,
    destination: PathBuf,
    scratch: Option<TempDir>,
    video_path: PathBuf,
    audio: Option<WavCapture>,
    state: Arc<RecorderState>,
    dropped: Arc<AtomicU64>,
    thread: Option<JoinHandle<RecorderResult>>,
}

impl LiveRecording {
    /// Pin the renderer's resolution, start the encoder and begin capturing.
    pub fn start(
        client: &RenderClient,
        mut toolchain: Box<dyn Toolchain>,
        settings: RecordingSettings,
        destination: impl Into<PathBuf>,
        audio: Option<AudioTap<'_>>,
    ) -> Result<Self, ExportError> {
        settings.validate()?;
        let destination = destination.into();
        let destination_dir = destination_dir(&destination);
        if !destination_dir.is_dir() {
            return Err(ExportError::Configuration(format!(
                "destination directory {} does not exist",
                destination_dir.display()
            )));
        }

        let scratch = tempfile::Builder::new()
            .prefix("phosphor-recording-")
            .tempdir()?;
        let video_path = scratch
            .path()
            .join(format!("video.{}", settings.extension()));

        let writer = toolchain.start_encoder(
            &settings,
            settings.resolution,
            settings.resolution,
            &video_path,
        )?;

        let render_error = |e: crate::gpu::RenderRequestError| ExportError::Render(e.to_string());
        client
            .parameters()
            .set_frame_rate(settings.frame_rate as f32);
        let (sink, frames) = CaptureSink::new(CAPTURE_QUEUE);
        let dropped = sink.dropped();
        let attached = client
            .lock_resolution(Some(settings.resolution))
            .and_then(|()| client.add_sink(Box::new(sink)));
        if let Err(e) = attached {
            writer.cancel();
            return Err(render_error(e));
        }

        let audio = match audio {
            Some(tap) if settings.record_audio => {
                let path = scratch.path().join("audio.wav");
                match WavCapture::start(tap.bus, tap.sample_rate, &path) {
                    Ok(capture) => Some(capture),
                    Err(e) => {
                        writer.cancel();
                        let _ = client.lock_resolution(None);
                        return Err(e.into());
                    }
                }
            }
            _ => None,
        };

        let state = Arc::new(RecorderState::default());
        let thread_state = Arc::clone(&state);
        let resolution = settings.resolution;
        let thread = thread::Builder::new()
            .name("recorder".to_string())
            .spawn(move || record(frames, writer, resolution, &thread_state))?;

        log::info!("Recording started: {}", destination.display());
        Ok(Self {
            client: client.clone(),
            toolchain,
            settings,
            destination,
            scratch: Some(scratch),
            video_path,
            audio,
            state,
            dropped,
            thread: Some(thread),
        })
    }

    /// Frames handed to the encoder so far.
    pub fn frames(&self) -> u64 {
        self.state.frames.load(Ordering::Relaxed)
    }

    /// Frames the recorder could not keep up with.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// True once the encoder rejected a frame. The recording has stopped
    /// and [`LiveRecording::stop`] reports the error.
    pub fn has_failed(&self) -> bool {
        self.state.failed.load(Ordering::Acquire)
    }

    /// Finish the recording and write the destination.
    pub fn stop(mut self) -> ExportOutcome {
        let outcome = ExportOutcome::from(self.finish());
        log::info!("{outcome}");
        outcome
    }

    /// Abandon the recording. Nothing is written to the destination.
    pub fn cancel(mut self) {
        self.abort();
    }

    fn finish(&mut self) -> Result<ExportSummary, ExportError> {
        self.state.stop.store(true, Ordering::Release);
        let joined = self.join();
        let _ = self.client.lock_resolution(None);
        let audio = match self.audio.take() {
            Some(capture) => Some(capture.finish()),
            None => None,
        };

        let (writer, frames) = joined?;
        writer.finish()?;
        let audio = audio.transpose()?;
        if frames == 0 {
            return Err(ExportError::Render("no frames were recorded".to_string()));
        }

        let extension = self.settings.extension();
        let staged = tempfile::Builder::new()
            .prefix(".phosphor-")
            .suffix(&format!(".{extension}"))
            .tempfile_in(destination_dir(&self.destination))?;
        match &audio {
            Some(captured) => self.toolchain.mux(
                &self.video_path,
                &captured.path,
                staged.path(),
                &self.state.cancel,
            )?,
            None => {
                fs::copy(&self.video_path, staged.path())?;
            }
        }
        staged
            .persist(&self.destination)
            .map_err(|e| ExportError::Io(e.error))?;
        self.scratch.take();

        Ok(ExportSummary {
            destination: self.destination.clone(),
            frames: frames as usize,
            duration: frames as f64 / self.settings.frame_rate,
            with_audio: audio.is_some(),
        })
    }

    fn abort(&mut self) {
        if self.thread.is_none() {
            return;
        }
        self.state.cancel.store(true, Ordering::Release);
        self.state.stop.store(true, Ordering::Release);
        if let Ok((writer, _)) = self.join() {
            writer.cancel();
        }
        self.audio.take();
        let _ = self.client.lock_resolution(None);
        self.scratch.take();
        log::info!("Recording cancelled");
    }

    fn join(&mut self) -> RecorderResult {
        match self.thread.take() {
            Some(thread) => thread
                .join()
                .unwrap_or_else(|_| Err(ExportError::Render("recorder thread panicked".to_string()))),
            None => Err(ExportError::Render("recording already finished".to_string())),
        }
    }
}

impl Drop for LiveRecording {
    fn drop(&mut self) {
        self.abort();
    }
}

fn destination_dir(destination: &Path) -> &Path {
    match destination.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

fn record(
    frames: Receiver<CapturedFrame>,
    mut writer: Box<dyn FrameWriter>,
    resolution: u32,
    state: &RecorderState,
) -> RecorderResult {
    let expected_len = CapturedFrame::byte_len(resolution, resolution);
    while !state.stop.load(Ordering::Acquire) {
        let frame = match frames.recv_timeout(POLL) {
            Ok(frame) => frame,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        if frame.pixels.len() != expected_len {
            state.skipped.fetch_add(1, Ordering::Relaxed);
            log::debug!("Skipping {}x{} frame while recording", frame.width, frame.height);
            continue;
        }
        if let Err(e) = writer.write_frame(&frame.pixels) {
            log::error!("Recording stopped: {e}");
            state.failed.store(true, Ordering::Release);
            writer.cancel();
            return Err(e);
        }
        state.frames.fetch_add(1, Ordering::Relaxed);
    }
    // Dropping the receiver closes the sink on the render thread.
    drop(frames);
    let frames = state.frames.load(Ordering::Relaxed);
    let skipped = state.skipped.load(Ordering::Relaxed);
    if skipped > 0 {
        log::warn!("Skipped {skipped} frames of the wrong size");
    }
    Ok((writer, frames))
}
