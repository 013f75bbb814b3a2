//! Offline export and live recording.
//!
//! An [`ExportSession`] turns an audio file into a video: it waits for the
//! renderer, decodes the audio, renders exactly one frame per fixed-size
//! chunk, streams the frames to an encoder and muxes the source audio back
//! in. The destination is only replaced once everything succeeded.

pub mod live;
pub mod session;
pub mod toolchain;

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::audio::{CaptureError, DecodeError};
use crate::config::ConfigError;
use crate::video::EncoderError;

pub use live::{AudioTap, LiveRecording};
pub use session::{ExportHandle, ExportRenderer, ExportRequest, ExportSession};
pub use toolchain::{EncoderWriter, FfmpegToolchain, FrameWriter, Toolchain};

/// Why an export or recording failed.
#[derive(Error, Debug)]
pub enum ExportError {
    #[error("invalid settings: {0}")]
    Configuration(String),

    #[error("could not start encoder: {0}")]
    EncoderStart(#[source] EncoderError),

    #[error("encoder stopped accepting frames (timed out after {0:?})")]
    EncoderWriteTimeout(std::time::Duration),

    #[error("encoder failed: {0}")]
    Encoder(#[source] EncoderError),

    #[error("could not decode audio: {0}")]
    Decode(#[from] DecodeError),

    #[error("could not capture audio: {0}")]
    Capture(#[from] CaptureError),

    #[error("muxing failed: {0}")]
    Mux(String),

    #[error("rendering failed: {0}")]
    Render(String),

    #[error("renderer was not ready after {0:?}")]
    RendererTimeout(std::time::Duration),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cancelled")]
    Cancelled,
}

impl From<ConfigError> for ExportError {
    fn from(e: ConfigError) -> Self {
        ExportError::Configuration(e.to_string())
    }
}

impl From<EncoderError> for ExportError {
    fn from(e: EncoderError) -> Self {
        match e {
            EncoderError::Start { .. } => ExportError::EncoderStart(e),
            EncoderError::WriteTimeout(timeout) => ExportError::EncoderWriteTimeout(timeout),
            EncoderError::Cancelled => ExportError::Cancelled,
            other => ExportError::Encoder(other),
        }
    }
}

/// Where an export currently is. Phases only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ExportPhase {
    WaitingForRenderer = 0,
    Decoding = 1,
    Rendering = 2,
    Muxing = 3,
    Finalizing = 4,
    Done = 5,
}

impl ExportPhase {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => ExportPhase::WaitingForRenderer,
            1 => ExportPhase::Decoding,
            2 => ExportPhase::Rendering,
            3 => ExportPhase::Muxing,
            4 => ExportPhase::Finalizing,
            _ => ExportPhase::Done,
        }
    }
}

impl fmt::Display for ExportPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExportPhase::WaitingForRenderer => "waiting for renderer",
            ExportPhase::Decoding => "decoding",
            ExportPhase::Rendering => "rendering",
            ExportPhase::Muxing => "muxing",
            ExportPhase::Finalizing => "finalizing",
            ExportPhase::Done => "done",
        };
        f.write_str(name)
    }
}

/// Summary of a finished export.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportSummary {
    pub destination: PathBuf,
    pub frames: usize,
    /// Video duration in seconds: frames / frame rate.
    pub duration: f64,
    pub with_audio: bool,
}

/// Final result of an export or recording.
#[derive(Debug)]
pub enum ExportOutcome {
    Completed(ExportSummary),
    Failed(ExportError),
    Cancelled,
}

impl ExportOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, ExportOutcome::Completed(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ExportOutcome::Cancelled)
    }
}

impl From<Result<ExportSummary, ExportError>> for ExportOutcome {
    fn from(result: Result<ExportSummary, ExportError>) -> Self {
        match result {
            Ok(summary) => ExportOutcome::Completed(summary),
            Err(ExportError::Cancelled) => ExportOutcome::Cancelled,
            Err(e) => ExportOutcome::Failed(e),
        }
    }
}

impl fmt::Display for ExportOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExportOutcome::Completed(summary) => write!(
                f,
                "Exported {} frames ({:.2}s) to {}",
                summary.frames,
                summary.duration,
                summary.destination.display()
            ),
            ExportOutcome::Failed(e) => write!(f, "Export failed: {e}"),
            ExportOutcome::Cancelled => f.write_str("Export cancelled"),
        }
    }
}

/// How source audio maps onto video frames: every frame covers exactly
/// `samples_per_frame` audio frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramePlan {
    pub samples_per_frame: usize,
    pub frame_count: usize,
}

impl FramePlan {
    pub fn new(sample_rate: u32, total_samples: usize, frame_rate: f64) -> Self {
        let samples_per_frame = if frame_rate > 0.0 {
            ((sample_rate as f64 / frame_rate).round() as usize).max(1)
        } else {
            1
        };
        let frame_count = total_samples.div_ceil(samples_per_frame).max(1);
        Self {
            samples_per_frame,
            frame_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_plan_two_second_sine() {
        let plan = FramePlan::new(44_100, 88_200, 60.0);
        assert_eq!(plan.samples_per_frame, 735);
        assert_eq!(plan.frame_count, 120);
    }

    #[test]
    fn test_frame_plan_rounds_partial_frame_up() {
        let plan = FramePlan::new(44_100, 44_541, 30.0);
        assert_eq!(plan.samples_per_frame, 1470);
        assert_eq!(plan.frame_count, 31);
        let duration = plan.frame_count as f64 / 30.0;
        assert!((duration - 44_541.0 / 44_100.0).abs() <= 1.0 / 30.0);
    }

    #[test]
    fn test_frame_plan_never_empty() {
        assert_eq!(FramePlan::new(48_000, 0, 60.0).frame_count, 1);
        assert_eq!(FramePlan::new(10, 100, 60.0).samples_per_frame, 1);
    }

    #[test]
    fn test_encoder_errors_map_to_kinds() {
        let timeout = std::time::Duration::from_millis(250);
        assert!(matches!(
            ExportError::from(EncoderError::WriteTimeout(timeout)),
            ExportError::EncoderWriteTimeout(t) if t == timeout
        ));
        assert!(matches!(
            ExportError::from(EncoderError::Cancelled),
            ExportError::Cancelled
        ));
    }

    #[test]
    fn test_cancelled_result_is_not_a_failure() {
        let outcome = ExportOutcome::from(Err(ExportError::Cancelled));
        assert!(outcome.is_cancelled());
        assert_eq!(outcome.to_string(), "Export cancelled");
    }
}
