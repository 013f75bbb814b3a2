//! Encoder and mux command lines.

use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::gpu::RowOrder;

use super::codec::{BitrateHeuristic, CompressionPreset, VideoCodec};

/// Audio bitrate used when muxing.
pub const MUX_AUDIO_BITRATE: &str = "384k";

/// A program and its arguments, kept separate so nothing is shell-parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderCommand {
    pub program: PathBuf,
    pub args: Vec<OsString>,
}

impl EncoderCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Whether any argument equals `value`.
    pub fn contains(&self, value: &str) -> bool {
        self.args.iter().any(|arg| arg == value)
    }

    /// Argument following the first occurrence of `flag`.
    pub fn value_of(&self, flag: &str) -> Option<&OsString> {
        let index = self.args.iter().position(|arg| arg == flag)?;
        self.args.get(index + 1)
    }

    pub fn to_command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        command
    }
}

impl fmt::Display for EncoderCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            let arg = arg.to_string_lossy();
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(f, " \"{arg}\"")?;
            } else {
                write!(f, " {arg}")?;
            }
        }
        Ok(())
    }
}

/// Everything needed to build one encode command.
#[derive(Debug, Clone)]
pub struct EncodeSettings {
    pub codec: VideoCodec,
    /// Concrete encoder, e.g. `h264_nvenc`. Usually chosen by the selector.
    pub encoder: String,
    pub crf: u32,
    pub width: u32,
    pub height: u32,
    pub frame_rate: f64,
    pub preset: CompressionPreset,
    /// Row order of the raw frames on stdin.
    pub row_order: RowOrder,
    pub bitrate: BitrateHeuristic,
    /// 0..100 quality target. When set, encoders with a constant-quality
    /// mode use it instead of a bitrate estimate.
    pub hardware_quality: Option<u32>,
    pub output: PathBuf,
}

/// Build the command that reads raw RGBA frames on stdin and encodes them to
/// `settings.output`.
pub fn build_encode_command(ffmpeg: &Path, settings: &EncodeSettings) -> EncoderCommand {
    let mut cmd = EncoderCommand::new(ffmpeg)
        .arg("-hide_banner")
        .args(["-loglevel", "error"])
        .args(["-r", format_rate(settings.frame_rate).as_str()])
        .args(["-f", "rawvideo"])
        .args(["-pix_fmt", "rgba"])
        .args(["-s", format!("{}x{}", settings.width, settings.height).as_str()])
        .args(["-i", "-"])
        .args(["-threads", "4"])
        .arg("-y")
        .args(["-pix_fmt", "yuv420p"]);
    if settings.row_order == RowOrder::BottomUp {
        cmd = cmd.args(["-vf", "vflip"]);
    }

    let crf = settings.crf.to_string();
    let encoder = settings.encoder.as_str();
    cmd = cmd.args(["-c:v", encoder]);
    cmd = match settings.codec {
        VideoCodec::Vp9 => cmd.args([
            "-b:v", "0", "-crf", crf.as_str(), "-deadline", "good", "-cpu-used", "2",
        ]),
        VideoCodec::ProRes => cmd.args(["-profile:v", "3"]),
        VideoCodec::H264 | VideoCodec::H265 => {
            if encoder.ends_with("_nvenc") {
                let profile = if settings.codec == VideoCodec::H264 {
                    "high"
                } else {
                    "main"
                };
                cmd.args([
                    "-preset", "p7", "-profile:v", profile, "-rc", "vbr", "-cq", crf.as_str(), "-b:v",
                    "0",
                ])
            } else if encoder.ends_with("_amf") {
                cmd.args([
                    "-quality", "quality", "-rc", "cqp", "-qp_i", crf.as_str(), "-qp_p", crf.as_str(),
                ])
            } else if encoder.ends_with("_videotoolbox") {
                let cmd = match settings.hardware_quality {
                    Some(quality) => cmd.args(["-q:v", quality.min(100).to_string().as_str()]),
                    None => {
                        let bitrate = settings.bitrate.estimate(
                            settings.width,
                            settings.height,
                            settings.frame_rate,
                            settings.crf,
                        );
                        cmd.args(["-b:v", bitrate.to_string().as_str()])
                    }
                };
                if settings.codec == VideoCodec::H265 {
                    cmd.args(["-tag:v", "hvc1"])
                } else {
                    cmd
                }
            } else {
                cmd.args(["-preset", settings.preset.as_str(), "-crf", crf.as_str()])
            }
        }
    };

    cmd.arg(settings.output.as_os_str())
}

/// Build the command that copies the video stream and re-encodes the audio
/// into one container.
pub fn build_mux_command(ffmpeg: &Path, video: &Path, audio: &Path, output: &Path) -> EncoderCommand {
    EncoderCommand::new(ffmpeg)
        .arg("-hide_banner")
        .args(["-loglevel", "error"])
        .arg("-i")
        .arg(video.as_os_str())
        .arg("-i")
        .arg(audio.as_os_str())
        .args(["-c:v", "copy", "-c:a", "aac", "-b:a", MUX_AUDIO_BITRATE, "-shortest", "-y"])
        .arg(output.as_os_str())
}

/// Short synthetic encode used to check an encoder actually works.
pub fn build_probe_command(ffmpeg: &Path, encoder: &str) -> EncoderCommand {
    EncoderCommand::new(ffmpeg)
        .args(["-v", "error", "-f", "lavfi", "-i", "nullsrc=s=640x360:r=30"])
        .args(["-t", "1", "-c:v", encoder, "-f", "null", "-"])
}

/// Command that lists every encoder the tool knows.
pub fn build_list_command(ffmpeg: &Path) -> EncoderCommand {
    EncoderCommand::new(ffmpeg).args(["-encoders", "-hide_banner"])
}

fn format_rate(rate: f64) -> String {
    if rate.fract() == 0.0 {
        format!("{}", rate as u64)
    } else {
        format!("{rate:.3}")
    }
}
