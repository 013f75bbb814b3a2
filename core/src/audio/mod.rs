//! Audio input, distribution, and shaping.
//!
//! This module provides:
//! - Whole-file decoding via Symphonia (WAV, MP3, FLAC, AAC)
//! - The lock-free sample bus between the real-time callback and workers
//! - Band-limited resampling and channel-to-beam mapping
//! - WAV capture of the live stream

pub mod bus;
pub mod capture;
pub mod loader;
pub mod points;
pub mod resampler;
pub mod synth;

pub use bus::{AudioBlock, BlockPublisher, BusShape, BusStats, ConsumerHandle, ReadError, SampleBus};
pub use capture::{CaptureError, CapturedAudio, WavCapture};
pub use loader::{load_audio, AudioData, DecodeError, FrameChunks};
pub use points::{BeamFrame, BeamPoint, ChannelLayout, PointShaper, DEFAULT_POINT_RATE};
pub use resampler::LanczosResampler;
pub use synth::{generate_lissajous, generate_sine, generate_stereo_sine, generate_white_noise, write_wav};
