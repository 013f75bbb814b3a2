//! Codecs, encoder names and quality mappings.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Output video codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    /// H.264 for YouTube/TikTok/Instagram.
    #[default]
    H264,
    H265,
    /// VP9 for web use.
    Vp9,
    /// ProRes 422 HQ for editing workflows.
    ProRes,
}

impl VideoCodec {
    pub const ALL: [VideoCodec; 4] = [
        VideoCodec::H264,
        VideoCodec::H265,
        VideoCodec::Vp9,
        VideoCodec::ProRes,
    ];

    /// Encoders to try, best first. Hardware encoders come before software.
    pub fn priority_list(&self) -> &'static [&'static str] {
        match self {
            VideoCodec::H264 => &["h264_nvenc", "h264_amf", "h264_videotoolbox", "libx264"],
            VideoCodec::H265 => &["hevc_nvenc", "hevc_amf", "hevc_videotoolbox", "libx265"],
            VideoCodec::Vp9 => &["libvpx-vp9"],
            VideoCodec::ProRes => &["prores_ks", "prores"],
        }
    }

    /// Software encoder used when nothing better works.
    pub fn fallback_encoder(&self) -> &'static str {
        match self {
            VideoCodec::H264 => "libx264",
            VideoCodec::H265 => "libx265",
            VideoCodec::Vp9 => "libvpx-vp9",
            VideoCodec::ProRes => "prores",
        }
    }

    /// Container extension for this codec.
    pub fn extension(&self) -> &'static str {
        match self {
            VideoCodec::ProRes => "mov",
            _ => "mp4",
        }
    }

    /// Which codec an encoder name belongs to, if any.
    pub fn for_encoder(name: &str) -> Option<VideoCodec> {
        if name == "libx264" || name.starts_with("h264_") {
            Some(VideoCodec::H264)
        } else if name == "libx265" || name.starts_with("hevc_") {
            Some(VideoCodec::H265)
        } else if name == "libvpx-vp9" {
            Some(VideoCodec::Vp9)
        } else if name.starts_with("prores") {
            Some(VideoCodec::ProRes)
        } else {
            None
        }
    }
}

impl fmt::Display for VideoCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            VideoCodec::H264 => "h264",
            VideoCodec::H265 => "h265",
            VideoCodec::Vp9 => "vp9",
            VideoCodec::ProRes => "prores",
        };
        f.write_str(name)
    }
}

/// Unknown codec name.
#[derive(Debug, thiserror::Error)]
#[error("unknown codec: {0}")]
pub struct UnknownCodec(pub String);

impl FromStr for VideoCodec {
    type Err = UnknownCodec;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "h264" | "avc" => Ok(VideoCodec::H264),
            "h265" | "hevc" => Ok(VideoCodec::H265),
            "vp9" => Ok(VideoCodec::Vp9),
            "prores" => Ok(VideoCodec::ProRes),
            _ => Err(UnknownCodec(s.to_string())),
        }
    }
}

/// Speed/size trade-off for the software encoders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionPreset {
    Ultrafast,
    Superfast,
    Veryfast,
    Faster,
    #[default]
    Fast,
    Medium,
    Slow,
    Slower,
    Veryslow,
}

impl CompressionPreset {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompressionPreset::Ultrafast => "ultrafast",
            CompressionPreset::Superfast => "superfast",
            CompressionPreset::Veryfast => "veryfast",
            CompressionPreset::Faster => "faster",
            CompressionPreset::Fast => "fast",
            CompressionPreset::Medium => "medium",
            CompressionPreset::Slow => "slow",
            CompressionPreset::Slower => "slower",
            CompressionPreset::Veryslow => "veryslow",
        }
    }
}

impl fmt::Display for CompressionPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unknown compression preset name.
#[derive(Debug, thiserror::Error)]
#[error("unknown compression preset: {0}")]
pub struct UnknownPreset(pub String);

impl FromStr for CompressionPreset {
    type Err = UnknownPreset;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        const ALL: [CompressionPreset; 9] = [
            CompressionPreset::Ultrafast,
            CompressionPreset::Superfast,
            CompressionPreset::Veryfast,
            CompressionPreset::Faster,
            CompressionPreset::Fast,
            CompressionPreset::Medium,
            CompressionPreset::Slow,
            CompressionPreset::Slower,
            CompressionPreset::Veryslow,
        ];
        ALL.into_iter()
            .find(|preset| preset.as_str() == s)
            .ok_or_else(|| UnknownPreset(s.to_string()))
    }
}

/// CRF for a quality in 0..1: 0 when lossless, otherwise 1 (best) to 51.
pub fn crf_for_quality(quality: f64, lossless: bool) -> u32 {
    if lossless {
        return 0;
    }
    let quality = quality.clamp(0.0, 1.0);
    (50.0 * (1.0 - quality)).round() as u32 + 1
}

/// VideoToolbox-style 0..100 quality.
pub fn hardware_quality(quality: f64, lossless: bool) -> u32 {
    if lossless {
        return 100;
    }
    (100.0 * quality.clamp(0.0, 1.0)).round() as u32
}

/// Estimates a target bitrate for encoders that take a bitrate instead of a
/// CRF: `bits_per_pixel * w * h * fps * 2^((reference_crf - crf) / 6)`,
/// clamped.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BitrateHeuristic {
    /// Bits per pixel at the reference CRF.
    pub bits_per_pixel: f64,
    pub reference_crf: f64,
    pub min_bitrate: u64,
    pub max_bitrate: u64,
}

impl Default for BitrateHeuristic {
    fn default() -> Self {
        Self {
            bits_per_pixel: 0.1,
            reference_crf: 23.0,
            min_bitrate: 250_000,
            max_bitrate: 100_000_000,
        }
    }
}

impl BitrateHeuristic {
    /// Bits per second for the given frame size, rate and CRF.
    pub fn estimate(&self, width: u32, height: u32, frame_rate: f64, crf: u32) -> u64 {
        let frame_rate = if frame_rate > 0.0 { frame_rate } else { 30.0 };
        let multiplier = 2f64.powf((self.reference_crf - crf as f64) / 6.0);
        let bitrate =
            self.bits_per_pixel * width as f64 * height as f64 * frame_rate * multiplier;
        (bitrate.max(0.0) as u64).clamp(self.min_bitrate, self.max_bitrate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_lists_end_in_software() {
        for codec in VideoCodec::ALL {
            let list = codec.priority_list();
            assert_eq!(*list.last().unwrap(), codec.fallback_encoder());
            for name in list {
                assert_eq!(VideoCodec::for_encoder(name), Some(codec));
            }
        }
    }

    #[test]
    fn test_extension_per_codec() {
        assert_eq!(VideoCodec::ProRes.extension(), "mov");
        assert_eq!(VideoCodec::H264.extension(), "mp4");
        assert_eq!(VideoCodec::Vp9.extension(), "mp4");
    }

    #[test]
    fn test_codec_parsing() {
        assert_eq!("HEVC".parse::<VideoCodec>().unwrap(), VideoCodec::H265);
        assert_eq!("vp9".parse::<VideoCodec>().unwrap(), VideoCodec::Vp9);
        assert!("mpeg2".parse::<VideoCodec>().is_err());
        assert_eq!("slow".parse::<CompressionPreset>().unwrap(), CompressionPreset::Slow);
        assert!("glacial".parse::<CompressionPreset>().is_err());
    }

    #[test]
    fn test_crf_mapping() {
        assert_eq!(crf_for_quality(0.7, true), 0);
        assert_eq!(crf_for_quality(1.0, false), 1);
        assert_eq!(crf_for_quality(0.0, false), 51);
        assert_eq!(crf_for_quality(0.5, false), 26);
        assert_eq!(crf_for_quality(7.0, false), 1);
        assert_eq!(hardware_quality(0.5, false), 50);
        assert_eq!(hardware_quality(0.1, true), 100);
    }

    #[test]
    fn test_bitrate_heuristic_shape() {
        let heuristic = BitrateHeuristic::default();
        // 1920x1080 at 30 fps, reference CRF: 0.1 bpp.
        let reference = heuristic.estimate(1920, 1080, 30.0, 23);
        assert_eq!(reference, 6_220_800);
        // Six CRF steps halve the bitrate.
        let halved = heuristic.estimate(1920, 1080, 30.0, 29);
        assert!((halved as f64 - reference as f64 / 2.0).abs() < 2.0);
        // Clamped at both ends.
        assert_eq!(heuristic.estimate(16, 16, 1.0, 51), 250_000);
        assert_eq!(heuristic.estimate(7680, 4320, 240.0, 0), 100_000_000);
    }
}
