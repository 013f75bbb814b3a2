//! Video encoding through an external ffmpeg process.
//!
//! Provides:
//! - Codec and encoder naming, quality and bitrate mappings
//! - Command lines for encoding, muxing and probing
//! - [`EncoderProcess`], a raw-frame pipe with bounded-wait backpressure
//! - [`EncoderSelector`], which picks an encoder that actually works here

pub mod codec;
pub mod command;
pub mod process;
pub mod selector;

use std::path::Path;
use std::process::{Command, Stdio};

pub use codec::{crf_for_quality, hardware_quality, BitrateHeuristic, CompressionPreset, VideoCodec};
pub use command::{build_encode_command, build_mux_command, EncodeSettings, EncoderCommand};
pub use process::{run_bounded, EncoderError, EncoderProcess, JobState};
pub use selector::{parse_encoder_list, EncoderDescriptor, EncoderProbe, EncoderSelector, FfmpegProbe, SelectorError};

/// Whether `ffmpeg` can be executed.
pub fn check_ffmpeg_available(ffmpeg: &Path) -> bool {
    Command::new(ffmpeg)
        .arg("-version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}
