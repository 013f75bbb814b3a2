//! User-facing settings, loaded from and saved to JSON.

use std::fs;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::gpu::{CompositorConfig, RenderParameters};
use crate::video::{crf_for_quality, hardware_quality, BitrateHeuristic, CompressionPreset, VideoCodec};

pub const FRAME_RATE_RANGE: RangeInclusive<f64> = 10.0..=240.0;
pub const RESOLUTION_RANGE: RangeInclusive<u32> = 128..=4096;

/// Rejected settings.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("frame rate {0} is outside {min}..={max}", min = FRAME_RATE_RANGE.start(), max = FRAME_RATE_RANGE.end())]
    FrameRate(f64),

    #[error("resolution {0} is outside {min}..={max}", min = RESOLUTION_RANGE.start(), max = RESOLUTION_RANGE.end())]
    Resolution(u32),

    #[error("quality {0} is outside 0..=1")]
    Quality(f64),

    #[error("unknown compression preset: {0}")]
    Preset(String),

    #[error("failed to read or write config: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid config JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// How recordings and exports are encoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingSettings {
    pub codec: VideoCodec,
    /// 0 (smallest) to 1 (best).
    pub quality: f64,
    pub lossless: bool,
    /// Encoder speed preset name, e.g. `fast`.
    pub compression_preset: String,
    /// Square frame edge in pixels.
    pub resolution: u32,
    pub frame_rate: f64,
    /// Mux an audio track into the output.
    pub record_audio: bool,
    /// Constants for encoders that need a target bitrate.
    pub bitrate: BitrateHeuristic,
    /// Give constant-quality capable hardware encoders (VideoToolbox on
    /// Apple silicon) [`RecordingSettings::hardware_quality`] instead of a
    /// bitrate. Off by default since older hardware rejects it.
    pub constant_quality: bool,
}

impl Default for RecordingSettings {
    fn default() -> Self {
        Self {
            codec: VideoCodec::H264,
            quality: 0.7,
            lossless: false,
            compression_preset: CompressionPreset::default().to_string(),
            resolution: 1024,
            frame_rate: 60.0,
            record_audio: true,
            bitrate: BitrateHeuristic::default(),
            constant_quality: false,
        }
    }
}

impl RecordingSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !FRAME_RATE_RANGE.contains(&self.frame_rate) {
            return Err(ConfigError::FrameRate(self.frame_rate));
        }
        if !RESOLUTION_RANGE.contains(&self.resolution) {
            return Err(ConfigError::Resolution(self.resolution));
        }
        if !(0.0..=1.0).contains(&self.quality) {
            return Err(ConfigError::Quality(self.quality));
        }
        self.preset()?;
        Ok(())
    }

    pub fn preset(&self) -> Result<CompressionPreset, ConfigError> {
        self.compression_preset
            .parse()
            .map_err(|_| ConfigError::Preset(self.compression_preset.clone()))
    }

    pub fn crf(&self) -> u32 {
        crf_for_quality(self.quality, self.lossless)
    }

    /// 0..100 quality for encoders that take one instead of a CRF.
    pub fn hardware_quality(&self) -> u32 {
        hardware_quality(self.quality, self.lossless)
    }

    /// The quality target handed to the encoder, if constant quality is on.
    pub fn quality_target(&self) -> Option<u32> {
        self.constant_quality.then(|| self.hardware_quality())
    }

    /// Container extension for the chosen codec.
    pub fn extension(&self) -> &'static str {
        self.codec.extension()
    }
}

/// Top-level application settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// ffmpeg executable; a bare name is looked up on `PATH`.
    pub ffmpeg_path: PathBuf,
    pub render: RenderParameters,
    pub recording: RecordingSettings,
    pub compositor: CompositorConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: PathBuf::from("ffmpeg"),
            render: RenderParameters::default(),
            recording: RecordingSettings::default(),
            compositor: CompositorConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.recording.validate()
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        let config: AppConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let text = serde_json::to_string_pretty(self)?;
        fs::write(path, text)?;
        Ok(())
    }
}
