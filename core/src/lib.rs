//! Phosphor Scope
//!
//! Oscilloscope-music renderer: turns a live or file-sourced audio signal
//! into a simulated CRT oscilloscope image and exports it as video.
//!
//! # Features
//!
//! - Audio loading (WAV, MP3, FLAC, AAC) via Symphonia
//! - Lock-free sample bus from the real-time callback to background workers
//! - Band-limited resampling into beam points
//! - GPU CRT simulation via wgpu: phosphor fade, Gaussian beam, bloom
//! - Video export through an external ffmpeg with tested encoder selection

pub mod audio;
pub mod config;
pub mod export;
pub mod gpu;
pub mod video;
pub mod worker;

// Re-export commonly used types
pub use audio::{load_audio, AudioData, BeamFrame, BeamPoint, SampleBus};
pub use config::{AppConfig, ConfigError, RecordingSettings};
pub use export::{
    ExportError, ExportHandle, ExportOutcome, ExportPhase, ExportRequest, ExportSession,
    FfmpegToolchain, FramePlan, LiveRecording,
};
pub use gpu::{
    Compositor, CompositorConfig, GpuContext, RenderClient, RenderParameters, RenderThread,
    SharedRenderParameters,
};
pub use video::{EncoderProcess, EncoderSelector, VideoCodec};
pub use worker::{BeamShaper, WorkerManager};
