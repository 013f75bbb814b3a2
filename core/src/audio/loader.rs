//! Whole-file audio decoding using Symphonia.
//!
//! Supports WAV, MP3, FLAC, and AAC. Export decodes the complete input up
//! front and then walks it in fixed-size chunks, one chunk per video frame.

use std::fs::File;
use std::path::Path;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use thiserror::Error;

/// Errors that can occur while decoding an input file.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("failed to open audio file: {0}")]
    Io(#[from] std::io::Error),

    #[error("unsupported or corrupt audio: {0}")]
    Format(#[from] SymphoniaError),

    #[error("no audio track found in file")]
    NoAudioTrack,

    #[error("unknown sample rate")]
    UnknownSampleRate,

    #[error("file decoded to zero samples")]
    Empty,
}

/// Decoded audio held in memory.
#[derive(Debug, Clone)]
pub struct AudioData {
    /// Interleaved samples, nominally within -1.0..1.0.
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: usize,
}

impl AudioData {
    /// Duration in seconds.
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 || self.channels == 0 {
            return 0.0;
        }
        self.num_frames() as f64 / self.sample_rate as f64
    }

    /// Number of frames (samples per channel).
    pub fn num_frames(&self) -> usize {
        if self.channels == 0 {
            return 0;
        }
        self.samples.len() / self.channels
    }

    /// Walk the audio in chunks of `frames_per_chunk` frames. The final chunk
    /// is zero-padded to full length.
    pub fn chunks(&self, frames_per_chunk: usize) -> FrameChunks<'_> {
        FrameChunks {
            audio: self,
            frames_per_chunk: frames_per_chunk.max(1),
            next_frame: 0,
            padded: Vec::new(),
        }
    }
}

/// Iterator over fixed-length chunks of interleaved audio.
pub struct FrameChunks<'a> {
    audio: &'a AudioData,
    frames_per_chunk: usize,
    next_frame: usize,
    padded: Vec<f32>,
}

impl FrameChunks<'_> {
    /// Number of chunks the iterator yields in total.
    pub fn total(&self) -> usize {
        self.audio.num_frames().div_ceil(self.frames_per_chunk).max(1)
    }

    /// Next chunk as a borrowed slice, valid until the following call.
    pub fn next_chunk(&mut self) -> Option<&[f32]> {
        let total_frames = self.audio.num_frames();
        // An empty input still yields one silent chunk.
        if self.next_frame >= total_frames && !(total_frames == 0 && self.next_frame == 0) {
            return None;
        }

        let channels = self.audio.channels.max(1);
        let start = self.next_frame * channels;
        let end_frame = (self.next_frame + self.frames_per_chunk).min(total_frames);
        let end = end_frame * channels;
        let chunk_len = self.frames_per_chunk * channels;
        self.next_frame += self.frames_per_chunk;

        if end - start == chunk_len {
            return Some(&self.audio.samples[start..end]);
        }

        self.padded.clear();
        self.padded.extend_from_slice(&self.audio.samples[start..end]);
        self.padded.resize(chunk_len, 0.0);
        Some(&self.padded)
    }
}

/// Decode an audio file into interleaved f32 samples.
///
/// # Example
///
/// ```no_run
/// use phosphor_scope::audio::loader::load_audio;
/// use std::path::Path;
///
/// let audio = load_audio(Path::new("lissajous.wav")).unwrap();
/// println!("{:.2}s at {}Hz, {} channels", audio.duration(), audio.sample_rate, audio.channels);
/// ```
pub fn load_audio(path: &Path) -> Result<AudioData, DecodeError> {
    let file = File::open(path)?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe().format(
        &hint,
        mss,
        &FormatOptions::default(),
        &MetadataOptions::default(),
    )?;
    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or(DecodeError::NoAudioTrack)?;

    let track_id = track.id;
    let sample_rate = track
        .codec_params
        .sample_rate
        .ok_or(DecodeError::UnknownSampleRate)?;
    let mut channels = track.codec_params.channels.map(|c| c.count()).unwrap_or(2);

    let mut decoder =
        symphonia::default::get_codecs().make(&track.codec_params, &DecoderOptions::default())?;

    let mut samples = Vec::new();
    let mut sample_buf: Option<SampleBuffer<f32>> = None;

    loop {
        let packet = match format.next_packet() {
            Ok(p) => p,
            Err(SymphoniaError::IoError(ref e))
                if e.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                break;
            }
            Err(SymphoniaError::ResetRequired) => {
                decoder.reset();
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(d) => d,
            Err(SymphoniaError::DecodeError(msg)) => {
                log::warn!("skipping undecodable packet: {msg}");
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        if sample_buf.is_none() {
            let spec = *decoded.spec();
            channels = spec.channels.count();
            sample_buf = Some(SampleBuffer::new(decoded.capacity() as u64, spec));
        }

        if let Some(buf) = &mut sample_buf {
            buf.copy_interleaved_ref(decoded);
            samples.extend_from_slice(buf.samples());
        }
    }

    if samples.is_empty() {
        return Err(DecodeError::Empty);
    }

    log::debug!(
        "decoded {}: {} frames, {} Hz, {} channels",
        path.display(),
        samples.len() / channels.max(1),
        sample_rate,
        channels
    );

    Ok(AudioData {
        samples,
        sample_rate,
        channels,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stereo(frames: usize) -> AudioData {
        AudioData {
            samples: (0..frames * 2).map(|i| i as f32).collect(),
            sample_rate: 44100,
            channels: 2,
        }
    }

    #[test]
    fn test_audio_data_duration() {
        let audio = AudioData {
            samples: vec![0.0; 44100 * 2],
            sample_rate: 44100,
            channels: 2,
        };
        assert!((audio.duration() - 1.0).abs() < 0.001);
        assert_eq!(audio.num_frames(), 44100);
    }

    #[test]
    fn test_chunks_pad_final_chunk() {
        let audio = stereo(10);
        let mut chunks = audio.chunks(4);
        assert_eq!(chunks.total(), 3);

        assert_eq!(chunks.next_chunk().unwrap(), &audio.samples[0..8]);
        assert_eq!(chunks.next_chunk().unwrap(), &audio.samples[8..16]);

        let last = chunks.next_chunk().unwrap().to_vec();
        assert_eq!(last.len(), 8);
        assert_eq!(&last[..4], &audio.samples[16..20]);
        assert!(last[4..].iter().all(|&s| s == 0.0));

        assert!(chunks.next_chunk().is_none());
    }

    #[test]
    fn test_chunks_exact_multiple() {
        let audio = stereo(12);
        let mut chunks = audio.chunks(4);
        let mut count = 0;
        while chunks.next_chunk().is_some() {
            count += 1;
        }
        assert_eq!(count, 3);
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let err = load_audio(Path::new("/nonexistent/input.wav")).unwrap_err();
        assert!(matches!(err, DecodeError::Io(_)));
    }
}
