//! Synthetic test signals.
//!
//! Oscilloscope music is stereo by nature, so most generators here produce
//! interleaved left/right frames that trace a figure on the XY display.

use std::f32::consts::PI;
use std::path::Path;

use super::loader::AudioData;

/// Generate a mono sine wave.
///
/// # Arguments
/// * `frequency` - Frequency in Hz
/// * `sample_rate` - Sample rate in Hz
/// * `duration` - Duration in seconds
/// * `amplitude` - Amplitude (0.0 to 1.0)
pub fn generate_sine(frequency: f32, sample_rate: u32, duration: f32, amplitude: f32) -> Vec<f32> {
    let num_samples = (duration * sample_rate as f32) as usize;
    (0..num_samples)
        .map(|i| {
            let t = i as f32 / sample_rate as f32;
            amplitude * (2.0 * PI * frequency * t).sin()
        })
        .collect()
}

/// Same sine on both channels: a diagonal line on the XY display.
pub fn generate_stereo_sine(
    frequency: f32,
    sample_rate: u32,
    duration: f32,
    amplitude: f32,
) -> AudioData {
    let mono = generate_sine(frequency, sample_rate, duration, amplitude);
    let samples = mono.iter().flat_map(|&s| [s, s]).collect();
    AudioData {
        samples,
        sample_rate,
        channels: 2,
    }
}

/// Lissajous figure: sine at `fx` on the left channel, cosine at `fy` on
/// the right. Equal frequencies trace a circle.
pub fn generate_lissajous(
    fx: f32,
    fy: f32,
    sample_rate: u32,
    duration: f32,
    amplitude: f32,
) -> AudioData {
    let num_frames = (duration * sample_rate as f32) as usize;
    let mut samples = Vec::with_capacity(num_frames * 2);
    for i in 0..num_frames {
        let t = i as f32 / sample_rate as f32;
        samples.push(amplitude * (2.0 * PI * fx * t).sin());
        samples.push(amplitude * (2.0 * PI * fy * t).cos());
    }
    AudioData {
        samples,
        sample_rate,
        channels: 2,
    }
}

/// Generate white noise.
///
/// Uses a simple linear congruential generator for reproducibility.
pub fn generate_white_noise(
    sample_rate: u32,
    duration: f32,
    amplitude: f32,
    seed: u64,
) -> Vec<f32> {
    let num_samples = (duration * sample_rate as f32) as usize;

    let mut state = seed;
    let a: u64 = 6364136223846793005;
    let c: u64 = 1442695040888963407;

    (0..num_samples)
        .map(|_| {
            state = state.wrapping_mul(a).wrapping_add(c);
            let normalized = (state as f32 / u64::MAX as f32) * 2.0 - 1.0;
            amplitude * normalized
        })
        .collect()
}

/// Write interleaved samples to a 32-bit float WAV file.
pub fn write_wav(path: &Path, audio: &AudioData) -> Result<(), hound::Error> {
    let spec = hound::WavSpec {
        channels: audio.channels as u16,
        sample_rate: audio.sample_rate,
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };
    let mut writer = hound::WavWriter::create(path, spec)?;
    for &sample in &audio.samples {
        writer.write_sample(sample)?;
    }
    writer.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_sine() {
        let samples = generate_sine(440.0, 44100, 1.0, 0.5);
        assert_eq!(samples.len(), 44100);

        let max = samples.iter().cloned().fold(0.0f32, f32::max);
        assert!((max - 0.5).abs() < 0.01);
    }

    #[test]
    fn test_stereo_sine_duplicates_channels() {
        let audio = generate_stereo_sine(1000.0, 48000, 0.1, 0.8);
        assert_eq!(audio.channels, 2);
        assert_eq!(audio.num_frames(), 4800);
        for frame in audio.samples.chunks_exact(2) {
            assert_eq!(frame[0], frame[1]);
        }
    }

    #[test]
    fn test_lissajous_circle_has_constant_radius() {
        let audio = generate_lissajous(100.0, 100.0, 48000, 0.05, 0.5);
        for frame in audio.samples.chunks_exact(2) {
            let r = (frame[0] * frame[0] + frame[1] * frame[1]).sqrt();
            assert!((r - 0.5).abs() < 1e-3);
        }
    }

    #[test]
    fn test_generate_white_noise() {
        let samples = generate_white_noise(44100, 1.0, 1.0, 12345);
        assert_eq!(samples.len(), 44100);

        let has_positive = samples.iter().any(|&s| s > 0.0);
        let has_negative = samples.iter().any(|&s| s < 0.0);
        assert!(has_positive && has_negative);
    }

    #[test]
    fn test_write_wav_round_trips_through_loader() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        let audio = generate_stereo_sine(1000.0, 44100, 0.25, 0.5);
        write_wav(&path, &audio).unwrap();

        let loaded = super::super::loader::load_audio(&path).unwrap();
        assert_eq!(loaded.sample_rate, 44100);
        assert_eq!(loaded.channels, 2);
        assert_eq!(loaded.num_frames(), audio.num_frames());
    }
}
