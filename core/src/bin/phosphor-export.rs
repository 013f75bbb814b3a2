use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::Parser;

use phosphor_scope::config::AppConfig;
use phosphor_scope::export::{ExportOutcome, ExportRequest, ExportSession, FfmpegToolchain};
use phosphor_scope::gpu::{RenderThread, SharedRenderParameters};
use phosphor_scope::video::{CompressionPreset, VideoCodec};

#[derive(Parser)]
#[command(
    name = "phosphor-export",
    version,
    about = "Render an audio file through the CRT oscilloscope simulation to a video file"
)]
struct Cli {
    /// Audio file path (WAV, MP3, FLAC, AAC)
    input: PathBuf,

    /// Output video file path
    #[arg(short, long)]
    output: PathBuf,

    /// Configuration file (JSON); defaults are used when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Video codec (h264, h265, vp9, prores)
    #[arg(long)]
    codec: Option<VideoCodec>,

    /// Quality from 0 (smallest) to 1 (best)
    #[arg(long)]
    quality: Option<f64>,

    /// Encoder speed preset (ultrafast .. veryslow)
    #[arg(long)]
    preset: Option<CompressionPreset>,

    /// Frames per second
    #[arg(long)]
    fps: Option<f64>,

    /// Square frame edge in pixels
    #[arg(long)]
    resolution: Option<u32>,

    /// Leave the audio track out
    #[arg(long)]
    no_audio: bool,

    /// Constant-quality mode for hardware encoders that support it
    #[arg(long)]
    constant_quality: bool,

    /// Cancel the export if it runs longer than this
    #[arg(long)]
    max_seconds: Option<f64>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let mut config = match &cli.config {
        Some(path) => AppConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => AppConfig::default(),
    };
    let recording = &mut config.recording;
    if let Some(codec) = cli.codec {
        recording.codec = codec;
    }
    if let Some(quality) = cli.quality {
        recording.quality = quality;
    }
    if let Some(preset) = cli.preset {
        recording.compression_preset = preset.to_string();
    }
    if let Some(fps) = cli.fps {
        recording.frame_rate = fps;
    }
    if let Some(resolution) = cli.resolution {
        recording.resolution = resolution;
    }
    if cli.no_audio {
        recording.record_audio = false;
    }
    if cli.constant_quality {
        recording.constant_quality = true;
    }
    config.validate().context("invalid settings")?;

    let toolchain = FfmpegToolchain::new(&config.ffmpeg_path)?;
    let params = Arc::new(SharedRenderParameters::new(&config.render));
    let renderer = RenderThread::spawn(params, config.compositor.clone())
        .context("starting render thread")?;

    let request = ExportRequest::new(&cli.input, &cli.output, config.recording.clone());
    let mut handle = ExportSession::start(request, renderer, toolchain)
        .context("starting export")?;

    let started = Instant::now();
    let deadline = cli.max_seconds.map(Duration::from_secs_f64);
    let mut last_percent = None;
    loop {
        if handle.try_outcome().is_some() {
            break;
        }
        let percent = (handle.progress() * 100.0).round() as u32;
        if last_percent != Some(percent) {
            log::info!("{percent:>3}% ({})", handle.state());
            last_percent = Some(percent);
        }
        if deadline.is_some_and(|limit| started.elapsed() > limit) {
            log::warn!("Time limit reached, cancelling");
            handle.cancel();
        }
        thread::sleep(Duration::from_millis(100));
    }

    match handle.wait() {
        ExportOutcome::Completed(summary) => {
            println!(
                "Wrote {} ({} frames, {:.2}s{})",
                summary.destination.display(),
                summary.frames,
                summary.duration,
                if summary.with_audio { ", with audio" } else { "" }
            );
            Ok(())
        }
        ExportOutcome::Cancelled => bail!("export cancelled after {:.1}s", started.elapsed().as_secs_f64()),
        ExportOutcome::Failed(e) => Err(e).context("export failed"),
    }
}
