//! The external tools an export drives: an encoder that accepts raw frames
//! and a muxer that joins video and audio.

use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use crate::config::RecordingSettings;
use crate::gpu::RowOrder;
use crate::video::command::build_mux_command;
use crate::video::{
    build_encode_command, check_ffmpeg_available, run_bounded, EncodeSettings, EncoderError,
    EncoderProcess, EncoderSelector, FfmpegProbe,
};

use super::ExportError;

/// How long a single frame may wait for room in the encoder pipe.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound on a mux run.
pub const MUX_TIMEOUT: Duration = Duration::from_secs(600);

/// Accepts tightly packed top-down RGBA8 frames, one per call.
pub trait FrameWriter: Send {
    fn write_frame(&mut self, pixels: &[u8]) -> Result<(), ExportError>;

    /// Flush and wait until the output file is complete.
    fn finish(self: Box<Self>) -> Result<(), ExportError>;

    /// Abandon the output.
    fn cancel(self: Box<Self>);
}

/// Starts encoders and muxes their output.
pub trait Toolchain: Send {
    /// Start encoding `width`x`height` frames to `output`.
    fn start_encoder(
        &mut self,
        settings: &RecordingSettings,
        width: u32,
        height: u32,
        output: &Path,
    ) -> Result<Box<dyn FrameWriter>, ExportError>;

    /// Copy the video stream and re-encode `audio` into `output`. Stops early
    /// when `cancel` is set.
    fn mux(
        &mut self,
        video: &Path,
        audio: &Path,
        output: &Path,
        cancel: &AtomicBool,
    ) -> Result<(), ExportError>;
}

impl<T: Toolchain + ?Sized> Toolchain for Box<T> {
    fn start_encoder(
        &mut self,
        settings: &RecordingSettings,
        width: u32,
        height: u32,
        output: &Path,
    ) -> Result<Box<dyn FrameWriter>, ExportError> {
        (**self).start_encoder(settings, width, height, output)
    }

    fn mux(
        &mut self,
        video: &Path,
        audio: &Path,
        output: &Path,
        cancel: &AtomicBool,
    ) -> Result<(), ExportError> {
        (**self).mux(video, audio, output, cancel)
    }
}

/// [`FrameWriter`] over a running [`EncoderProcess`].
pub struct EncoderWriter {
    process: EncoderProcess,
    timeout: Duration,
}

impl EncoderWriter {
    pub fn new(process: EncoderProcess, timeout: Duration) -> Self {
        Self { process, timeout }
    }
}

impl FrameWriter for EncoderWriter {
    fn write_frame(&mut self, pixels: &[u8]) -> Result<(), ExportError> {
        self.process
            .write_frame(pixels, self.timeout)
            .map_err(ExportError::from)
    }

    fn finish(self: Box<Self>) -> Result<(), ExportError> {
        self.process.close().map_err(ExportError::from)
    }

    fn cancel(self: Box<Self>) {
        self.process.cancel();
    }
}

/// Toolchain backed by an ffmpeg executable.
pub struct FfmpegToolchain {
    ffmpeg: PathBuf,
    selector: EncoderSelector<FfmpegProbe>,
    write_timeout: Duration,
}

impl FfmpegToolchain {
    /// Fails with a configuration error when `ffmpeg` cannot be run.
    pub fn new(ffmpeg: impl Into<PathBuf>) -> Result<Self, ExportError> {
        let ffmpeg = ffmpeg.into();
        if !check_ffmpeg_available(&ffmpeg) {
            return Err(ExportError::Configuration(format!(
                "ffmpeg not found at {}",
                ffmpeg.display()
            )));
        }
        Ok(Self {
            selector: EncoderSelector::for_ffmpeg(ffmpeg.clone()),
            ffmpeg,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        })
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn selector(&self) -> &EncoderSelector<FfmpegProbe> {
        &self.selector
    }
}

impl Toolchain for FfmpegToolchain {
    fn start_encoder(
        &mut self,
        settings: &RecordingSettings,
        width: u32,
        height: u32,
        output: &Path,
    ) -> Result<Box<dyn FrameWriter>, ExportError> {
        let encoder = self.selector.best_encoder_for_codec(settings.codec);
        let encode = EncodeSettings {
            codec: settings.codec,
            encoder,
            crf: settings.crf(),
            width,
            height,
            frame_rate: settings.frame_rate,
            preset: settings.preset()?,
            row_order: RowOrder::TopDown,
            bitrate: settings.bitrate,
            hardware_quality: settings.quality_target(),
            output: output.to_path_buf(),
        };
        let command = build_encode_command(&self.ffmpeg, &encode);
        log::debug!("Encode command: {command}");
        let process = EncoderProcess::start(&command)?;
        Ok(Box::new(EncoderWriter::new(process, self.write_timeout)))
    }

    fn mux(
        &mut self,
        video: &Path,
        audio: &Path,
        output: &Path,
        cancel: &AtomicBool,
    ) -> Result<(), ExportError> {
        let command = build_mux_command(&self.ffmpeg, video, audio, output);
        log::debug!("Mux command: {command}");
        let result = run_bounded(&command, MUX_TIMEOUT, Some(cancel)).map_err(|e| match e {
            EncoderError::Cancelled => ExportError::Cancelled,
            other => ExportError::Mux(other.to_string()),
        })?;
        if !result.status.success() {
            return Err(ExportError::Mux(format!(
                "ffmpeg exited with {}: {}",
                result.status,
                result.stderr.trim()
            )));
        }
        Ok(())
    }
}
