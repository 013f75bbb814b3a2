//! Integration tests for the export session.
//!
//! The renderer and toolchain are replaced by in-process fakes, so these run
//! without a GPU or ffmpeg. The last test drives a real ffmpeg when one is
//! installed.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use phosphor_scope::audio::synth::{generate_stereo_sine, write_wav};
use phosphor_scope::audio::BeamFrame;
use phosphor_scope::config::RecordingSettings;
use phosphor_scope::export::{
    ExportError, ExportOutcome, ExportPhase, ExportRenderer, ExportRequest, ExportSession,
    FrameWriter, Toolchain,
};
use phosphor_scope::gpu::{CapturedFrame, Readiness, RowOrder};

const SAMPLE_RATE: u32 = 44_100;
const RESOLUTION: u32 = 128;

#[derive(Default)]
struct RendererLog {
    begun: Mutex<Option<(u32, f64)>>,
    ended: AtomicBool,
    frames: AtomicUsize,
    points: Mutex<Vec<usize>>,
}

struct FakeRenderer {
    log: Arc<RendererLog>,
    ready: Readiness,
    frame_delay: Duration,
    resolution: u32,
}

impl FakeRenderer {
    fn new(log: &Arc<RendererLog>) -> Self {
        Self {
            log: Arc::clone(log),
            ready: Readiness::Ready("fake".to_string()),
            frame_delay: Duration::ZERO,
            resolution: RESOLUTION,
        }
    }
}

impl ExportRenderer for FakeRenderer {
    fn poll_ready(&mut self, timeout: Duration) -> Readiness {
        if self.ready == Readiness::Pending {
            thread::sleep(timeout);
        }
        self.ready.clone()
    }

    fn begin(&mut self, resolution: u32, frame_rate: f64) -> Result<(), ExportError> {
        *self.log.begun.lock().unwrap() = Some((resolution, frame_rate));
        Ok(())
    }

    fn render(&mut self, frame: BeamFrame) -> Result<CapturedFrame, ExportError> {
        if !self.frame_delay.is_zero() {
            thread::sleep(self.frame_delay);
        }
        self.log.frames.fetch_add(1, Ordering::SeqCst);
        self.log.points.lock().unwrap().push(frame.points.len());
        let value = (frame.sequence % 251) as u8;
        Ok(CapturedFrame {
            width: self.resolution,
            height: self.resolution,
            row_order: RowOrder::TopDown,
            pixels: vec![value; CapturedFrame::byte_len(self.resolution, self.resolution)],
            sequence: frame.sequence,
        })
    }

    fn end(&mut self) {
        self.log.ended.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct ToolchainLog {
    started: AtomicUsize,
    video_paths: Mutex<Vec<PathBuf>>,
    frames_written: AtomicUsize,
    finished: AtomicBool,
    cancelled: AtomicBool,
    muxed: AtomicBool,
}

struct FakeWriter {
    log: Arc<ToolchainLog>,
    file: fs::File,
    fail_after: Option<usize>,
}

impl FrameWriter for FakeWriter {
    fn write_frame(&mut self, pixels: &[u8]) -> Result<(), ExportError> {
        use std::io::Write;
        let written = self.log.frames_written.load(Ordering::SeqCst);
        if self.fail_after.is_some_and(|n| written >= n) {
            return Err(ExportError::EncoderWriteTimeout(Duration::from_millis(250)));
        }
        self.file.write_all(pixels)?;
        self.log.frames_written.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<(), ExportError> {
        self.file.sync_all()?;
        self.log.finished.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn cancel(self: Box<Self>) {
        self.log.cancelled.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct FakeToolchain {
    log: Arc<ToolchainLog>,
    fail_after: Option<usize>,
}

impl Toolchain for FakeToolchain {
    fn start_encoder(
        &mut self,
        _settings: &RecordingSettings,
        width: u32,
        height: u32,
        output: &Path,
    ) -> Result<Box<dyn FrameWriter>, ExportError> {
        assert_eq!((width, height), (RESOLUTION, RESOLUTION));
        self.log.started.fetch_add(1, Ordering::SeqCst);
        self.log.video_paths.lock().unwrap().push(output.to_path_buf());
        Ok(Box::new(FakeWriter {
            log: Arc::clone(&self.log),
            file: fs::File::create(output)?,
            fail_after: self.fail_after,
        }))
    }

    fn mux(
        &mut self,
        video: &Path,
        audio: &Path,
        output: &Path,
        cancel: &AtomicBool,
    ) -> Result<(), ExportError> {
        assert!(audio.exists());
        if cancel.load(Ordering::SeqCst) {
            return Err(ExportError::Cancelled);
        }
        fs::copy(video, output)?;
        self.log.muxed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct Fixture {
    _input_dir: tempfile::TempDir,
    output_dir: tempfile::TempDir,
    input: PathBuf,
}

impl Fixture {
    fn sine(duration: f32) -> Self {
        let input_dir = tempfile::tempdir().unwrap();
        let input = input_dir.path().join("sine.wav");
        let audio = generate_stereo_sine(1000.0, SAMPLE_RATE, duration, 0.8);
        write_wav(&input, &audio).unwrap();
        Self {
            _input_dir: input_dir,
            output_dir: tempfile::tempdir().unwrap(),
            input,
        }
    }

    fn destination(&self) -> PathBuf {
        self.output_dir.path().join("out.mp4")
    }

    fn request(&self, frame_rate: f64) -> ExportRequest {
        let settings = RecordingSettings {
            resolution: RESOLUTION,
            frame_rate,
            ..Default::default()
        };
        ExportRequest::new(&self.input, self.destination(), settings)
    }

    fn output_entries(&self) -> Vec<PathBuf> {
        fs::read_dir(self.output_dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .collect()
    }
}

fn scratch_dirs(log: &ToolchainLog) -> Vec<PathBuf> {
    log.video_paths
        .lock()
        .unwrap()
        .iter()
        .map(|path| path.parent().unwrap().to_path_buf())
        .collect()
}

#[test]
fn test_export_two_second_sine() {
    let fixture = Fixture::sine(2.0);
    let renderer_log = Arc::new(RendererLog::default());
    let toolchain = FakeToolchain::default();
    let toolchain_log = Arc::clone(&toolchain.log);

    let handle = ExportSession::start(
        fixture.request(60.0),
        FakeRenderer::new(&renderer_log),
        toolchain,
    )
    .unwrap();
    let outcome = handle.wait();

    let summary = match outcome {
        ExportOutcome::Completed(summary) => summary,
        other => panic!("unexpected outcome: {other}"),
    };
    // 88200 frames / 735 samples per frame.
    assert_eq!(summary.frames, 120);
    assert!((summary.duration - 2.0).abs() <= 1.0 / 60.0);
    assert!(summary.with_audio);
    assert!(toolchain_log.muxed.load(Ordering::SeqCst));
    assert!(toolchain_log.finished.load(Ordering::SeqCst));

    assert_eq!(*renderer_log.begun.lock().unwrap(), Some((RESOLUTION, 60.0)));
    assert!(renderer_log.ended.load(Ordering::SeqCst));
    assert_eq!(renderer_log.frames.load(Ordering::SeqCst), 120);

    let written = fs::metadata(fixture.destination()).unwrap().len() as usize;
    assert_eq!(written, 120 * CapturedFrame::byte_len(RESOLUTION, RESOLUTION));
    assert_eq!(fixture.output_entries(), vec![fixture.destination()]);
    for dir in scratch_dirs(&toolchain_log) {
        assert!(!dir.exists(), "scratch directory left behind");
    }
}

#[test]
fn test_every_frame_gets_one_chunk_of_points() {
    let fixture = Fixture::sine(0.5);
    let renderer_log = Arc::new(RendererLog::default());

    let handle = ExportSession::start(
        fixture.request(30.0),
        FakeRenderer::new(&renderer_log),
        FakeToolchain::default(),
    )
    .unwrap();
    assert!(handle.wait().is_completed());

    // 1470 input frames at 44.1 kHz per video frame, resampled to 192 kHz.
    let points = renderer_log.points.lock().unwrap().clone();
    assert_eq!(points.len(), 15);
    let expected = 1470.0 * 192_000.0 / SAMPLE_RATE as f64;
    for &count in &points[1..] {
        assert!((count as f64 - expected).abs() <= 2.0, "{count} points");
    }
}

#[test]
fn test_partial_final_frame_rounds_up() {
    let fixture = Fixture::sine(1.01);
    let renderer_log = Arc::new(RendererLog::default());

    let handle = ExportSession::start(
        fixture.request(30.0),
        FakeRenderer::new(&renderer_log),
        FakeToolchain::default(),
    )
    .unwrap();

    match handle.wait() {
        ExportOutcome::Completed(summary) => {
            assert_eq!(summary.frames, 31);
            assert!((summary.duration - 1.01).abs() <= 1.0 / 30.0);
        }
        other => panic!("unexpected outcome: {other}"),
    }
}

#[test]
fn test_video_only_export_skips_mux() {
    let fixture = Fixture::sine(0.25);
    let toolchain = FakeToolchain::default();
    let toolchain_log = Arc::clone(&toolchain.log);
    let mut request = fixture.request(30.0);
    request.settings.record_audio = false;

    let handle = ExportSession::start(
        request,
        FakeRenderer::new(&Arc::new(RendererLog::default())),
        toolchain,
    )
    .unwrap();

    match handle.wait() {
        ExportOutcome::Completed(summary) => assert!(!summary.with_audio),
        other => panic!("unexpected outcome: {other}"),
    }
    assert!(!toolchain_log.muxed.load(Ordering::SeqCst));
    assert!(fixture.destination().exists());
}

#[test]
fn test_cancel_mid_export() {
    let fixture = Fixture::sine(2.0);
    let renderer_log = Arc::new(RendererLog::default());
    let mut renderer = FakeRenderer::new(&renderer_log);
    renderer.frame_delay = Duration::from_millis(5);
    let toolchain = FakeToolchain::default();
    let toolchain_log = Arc::clone(&toolchain.log);

    let handle = ExportSession::start(fixture.request(60.0), renderer, toolchain).unwrap();
    while renderer_log.frames.load(Ordering::SeqCst) < 10 {
        thread::sleep(Duration::from_millis(2));
    }
    handle.cancel();
    let outcome = handle.wait();

    assert!(outcome.is_cancelled(), "unexpected outcome: {outcome}");
    assert!(renderer_log.frames.load(Ordering::SeqCst) < 120);
    assert!(renderer_log.ended.load(Ordering::SeqCst));
    assert!(toolchain_log.cancelled.load(Ordering::SeqCst));
    assert!(!toolchain_log.finished.load(Ordering::SeqCst));
    assert!(!fixture.destination().exists());
    assert!(fixture.output_entries().is_empty());
    for dir in scratch_dirs(&toolchain_log) {
        assert!(!dir.exists(), "scratch directory left behind");
    }
}

#[test]
fn test_cancel_before_renderer_ready() {
    let fixture = Fixture::sine(0.5);
    let mut renderer = FakeRenderer::new(&Arc::new(RendererLog::default()));
    renderer.ready = Readiness::Pending;
    let toolchain = FakeToolchain::default();
    let toolchain_log = Arc::clone(&toolchain.log);

    let handle = ExportSession::start(fixture.request(30.0), renderer, toolchain).unwrap();
    thread::sleep(Duration::from_millis(20));
    assert_eq!(handle.state(), ExportPhase::WaitingForRenderer);
    handle.cancel();

    assert!(handle.wait().is_cancelled());
    assert_eq!(toolchain_log.started.load(Ordering::SeqCst), 0);
}

#[test]
fn test_encoder_write_timeout_fails_export() {
    let fixture = Fixture::sine(1.0);
    let toolchain = FakeToolchain {
        fail_after: Some(5),
        ..Default::default()
    };
    let toolchain_log = Arc::clone(&toolchain.log);

    let handle = ExportSession::start(
        fixture.request(30.0),
        FakeRenderer::new(&Arc::new(RendererLog::default())),
        toolchain,
    )
    .unwrap();

    match handle.wait() {
        ExportOutcome::Failed(ExportError::EncoderWriteTimeout(_)) => {}
        other => panic!("unexpected outcome: {other}"),
    }
    assert_eq!(toolchain_log.frames_written.load(Ordering::SeqCst), 5);
    assert!(toolchain_log.cancelled.load(Ordering::SeqCst));
    assert!(fixture.output_entries().is_empty());
}

#[test]
fn test_wrong_frame_size_fails_export() {
    let fixture = Fixture::sine(0.25);
    let mut renderer = FakeRenderer::new(&Arc::new(RendererLog::default()));
    renderer.resolution = 64;

    let handle = ExportSession::start(fixture.request(30.0), renderer, FakeToolchain::default())
        .unwrap();
    assert!(matches!(
        handle.wait(),
        ExportOutcome::Failed(ExportError::Render(_))
    ));
    assert!(!fixture.destination().exists());
}

#[test]
fn test_missing_input_is_decode_error() {
    let fixture = Fixture::sine(0.1);
    let mut request = fixture.request(30.0);
    request.input = fixture.output_dir.path().join("missing.wav");

    let handle = ExportSession::start(
        request,
        FakeRenderer::new(&Arc::new(RendererLog::default())),
        FakeToolchain::default(),
    )
    .unwrap();
    assert!(matches!(
        handle.wait(),
        ExportOutcome::Failed(ExportError::Decode(_))
    ));
}

#[test]
fn test_invalid_settings_rejected_before_encoder_starts() {
    let fixture = Fixture::sine(0.1);
    let mut request = fixture.request(30.0);
    request.settings.frame_rate = 500.0;
    let toolchain = FakeToolchain::default();
    let toolchain_log = Arc::clone(&toolchain.log);

    let handle = ExportSession::start(
        request,
        FakeRenderer::new(&Arc::new(RendererLog::default())),
        toolchain,
    )
    .unwrap();
    match handle.wait() {
        ExportOutcome::Failed(ExportError::Configuration(message)) => {
            assert!(message.contains("frame rate"));
        }
        other => panic!("unexpected outcome: {other}"),
    }
    assert_eq!(toolchain_log.started.load(Ordering::SeqCst), 0);
}

#[test]
fn test_renderer_failure_is_reported() {
    let fixture = Fixture::sine(0.1);
    let mut renderer = FakeRenderer::new(&Arc::new(RendererLog::default()));
    renderer.ready = Readiness::Failed("no adapter".to_string());

    let handle = ExportSession::start(fixture.request(30.0), renderer, FakeToolchain::default())
        .unwrap();
    match handle.wait() {
        ExportOutcome::Failed(ExportError::Render(message)) => assert_eq!(message, "no adapter"),
        other => panic!("unexpected outcome: {other}"),
    }
}

#[test]
fn test_progress_never_decreases() {
    let fixture = Fixture::sine(1.0);
    let mut renderer = FakeRenderer::new(&Arc::new(RendererLog::default()));
    renderer.frame_delay = Duration::from_millis(1);

    let mut handle =
        ExportSession::start(fixture.request(60.0), renderer, FakeToolchain::default()).unwrap();
    let mut last = 0.0;
    while handle.try_outcome().is_none() {
        let progress = handle.progress();
        assert!(progress >= last, "{progress} < {last}");
        assert!((0.0..=1.0).contains(&progress));
        last = progress;
        thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(handle.progress(), 1.0);
    assert_eq!(handle.state(), ExportPhase::Done);
    assert!(handle.wait().is_completed());
}

#[cfg(unix)]
#[test]
fn test_export_through_ffmpeg() {
    use phosphor_scope::export::FfmpegToolchain;

    let Ok(toolchain) = FfmpegToolchain::new("ffmpeg") else {
        return;
    };
    let Ok(available) = toolchain.selector().query_available() else {
        return;
    };
    let has_x264 = available
        .values()
        .flatten()
        .any(|descriptor| descriptor.name == "libx264");
    if !has_x264 {
        return;
    }

    let fixture = Fixture::sine(0.5);
    let handle = ExportSession::start(
        fixture.request(30.0),
        FakeRenderer::new(&Arc::new(RendererLog::default())),
        toolchain,
    )
    .unwrap();

    match handle.wait() {
        ExportOutcome::Completed(summary) => {
            assert_eq!(summary.frames, 15);
            assert!(fs::metadata(&summary.destination).unwrap().len() > 0);
        }
        other => panic!("unexpected outcome: {other}"),
    }
    assert_eq!(fixture.output_entries(), vec![fixture.destination()]);
}
