//! Encoder discovery and selection.
//!
//! The encoder tool lists what it was built with, but a listed hardware
//! encoder may still fail on this machine (no GPU, wrong driver). The
//! selector therefore runs a short synthetic encode with each candidate
//! before picking it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use super::codec::VideoCodec;
use super::command::{build_list_command, build_probe_command};
use super::process::{run_bounded, EncoderError};

/// Header lines before the first encoder row of the listing.
pub const LISTING_HEADER_LINES: usize = 10;

/// Upper bound on one functional test.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

const LIST_TIMEOUT: Duration = Duration::from_secs(10);

/// One row of the encoder listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderDescriptor {
    pub name: String,
    pub description: String,
    /// Raw six-character capability flags.
    pub flags: String,
    pub hardware: bool,
    /// Whether the flags mark it as a video encoder.
    pub supported: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum SelectorError {
    #[error("could not list encoders: {0}")]
    Listing(#[from] EncoderError),
    #[error("encoder listing failed: {0}")]
    ListingFailed(String),
}

/// Access to the encoder tool. Split out so selection logic can be tested
/// without one installed.
pub trait EncoderProbe: Send + Sync {
    /// Raw text of the encoder listing.
    fn list_encoders(&self) -> Result<String, SelectorError>;

    /// Run a short synthetic encode. `Err` carries the reason it failed.
    fn test_encoder(&self, name: &str) -> Result<(), String>;
}

/// Probe backed by an ffmpeg executable.
#[derive(Debug, Clone)]
pub struct FfmpegProbe {
    ffmpeg: PathBuf,
    timeout: Duration,
}

impl FfmpegProbe {
    pub fn new(ffmpeg: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            timeout: PROBE_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn ffmpeg(&self) -> &Path {
        &self.ffmpeg
    }
}

impl EncoderProbe for FfmpegProbe {
    fn list_encoders(&self) -> Result<String, SelectorError> {
        let output = run_bounded(&build_list_command(&self.ffmpeg), LIST_TIMEOUT, None)?;
        if !output.status.success() {
            return Err(SelectorError::ListingFailed(output.stderr.trim().to_string()));
        }
        Ok(output.stdout)
    }

    fn test_encoder(&self, name: &str) -> Result<(), String> {
        let output = run_bounded(&build_probe_command(&self.ffmpeg, name), self.timeout, None)
            .map_err(|e| e.to_string())?;
        let stderr = output.stderr.trim();
        if !output.status.success() {
            return Err(format!("exited with {}: {stderr}", output.status));
        }
        // A clean exit with error output still counts as a failure.
        if !stderr.is_empty() {
            return Err(stderr.to_string());
        }
        Ok(())
    }
}

/// Parse the fixed-column encoder listing.
///
/// Rows look like ` V....D libx264              libx264 H.264 / AVC ...`:
/// six flag characters, a space, then the name and description.
pub fn parse_encoder_list(listing: &str) -> Vec<EncoderDescriptor> {
    listing
        .lines()
        .skip(LISTING_HEADER_LINES)
        .filter_map(parse_encoder_line)
        .collect()
}

fn parse_encoder_line(line: &str) -> Option<EncoderDescriptor> {
    let line = line.strip_prefix(' ').unwrap_or(line);
    let flags = line.get(..6)?;
    let rest = line.get(7..)?.trim_start();
    let (name, description) = match rest.split_once(char::is_whitespace) {
        Some((name, description)) => (name, description.trim()),
        None => (rest, ""),
    };
    if name.is_empty() {
        return None;
    }
    Some(EncoderDescriptor {
        name: name.to_string(),
        description: description.to_string(),
        flags: flags.to_string(),
        hardware: is_hardware_encoder(name),
        supported: flags.contains('V'),
    })
}

/// Whether `name` is one of the hardware encoder families.
pub fn is_hardware_encoder(name: &str) -> bool {
    ["nvenc", "amf", "videotoolbox"]
        .iter()
        .any(|family| name.contains(family))
}

/// Chooses a working encoder for each codec.
pub struct EncoderSelector<P: EncoderProbe = FfmpegProbe> {
    probe: P,
    listing: Mutex<Option<Vec<EncoderDescriptor>>>,
}

impl EncoderSelector<FfmpegProbe> {
    pub fn for_ffmpeg(ffmpeg: impl Into<PathBuf>) -> Self {
        Self::new(FfmpegProbe::new(ffmpeg))
    }
}

impl<P: EncoderProbe> EncoderSelector<P> {
    pub fn new(probe: P) -> Self {
        Self {
            probe,
            listing: Mutex::new(None),
        }
    }

    pub fn probe(&self) -> &P {
        &self.probe
    }

    /// Every listed encoder that belongs to a known codec, grouped by codec.
    /// The listing is fetched once and cached.
    pub fn query_available(&self) -> Result<HashMap<VideoCodec, Vec<EncoderDescriptor>>, SelectorError> {
        let listing = self.listing()?;
        let mut available: HashMap<VideoCodec, Vec<EncoderDescriptor>> = HashMap::new();
        for descriptor in listing {
            if let Some(codec) = VideoCodec::for_encoder(&descriptor.name) {
                available.entry(codec).or_default().push(descriptor);
            }
        }
        Ok(available)
    }

    /// First encoder in the codec's priority list that is listed and passes
    /// a functional test, else the codec's software fallback.
    pub fn best_encoder_for_codec(&self, codec: VideoCodec) -> String {
        let listing = match self.listing() {
            Ok(listing) => listing,
            Err(e) => {
                log::warn!("Encoder listing unavailable ({e}); using {}", codec.fallback_encoder());
                return codec.fallback_encoder().to_string();
            }
        };

        for &candidate in codec.priority_list() {
            let listed = listing
                .iter()
                .any(|d| d.name == candidate && d.supported);
            if !listed {
                log::debug!("{candidate} is not available");
                continue;
            }
            match self.probe.test_encoder(candidate) {
                Ok(()) => {
                    log::info!("Selected encoder {candidate} for {codec}");
                    return candidate.to_string();
                }
                Err(reason) => log::warn!("Encoder {candidate} failed its test: {reason}"),
            }
        }

        let fallback = codec.fallback_encoder();
        log::info!("No tested encoder for {codec}; falling back to {fallback}");
        fallback.to_string()
    }

    fn listing(&self) -> Result<Vec<EncoderDescriptor>, SelectorError> {
        let mut cached = self
            .listing
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(listing) = cached.as_ref() {
            return Ok(listing.clone());
        }
        let listing = parse_encoder_list(&self.probe.list_encoders()?);
        log::debug!("Encoder listing has {} entries", listing.len());
        *cached = Some(listing.clone());
        Ok(listing)
    }
}
