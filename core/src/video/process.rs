//! An external encoder fed one raw frame at a time.
//!
//! Frames go to a writer thread over a channel with room for two frames; the
//! writer thread owns the child's stdin. [`EncoderProcess::write`] waits at
//! most its timeout for room in that channel, so a stalled child can never
//! block the caller indefinitely. Frame buffers are recycled between the two
//! sides.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, SendTimeoutError, Sender};

use super::command::EncoderCommand;

/// How much of the child's stderr is kept for error messages.
pub const STDERR_TAIL_BYTES: usize = 4096;

/// Frames that may be queued for the writer thread.
const QUEUED_FRAMES: usize = 2;

/// Poll interval while waiting for a child to exit.
const EXIT_POLL: Duration = Duration::from_millis(200);

/// Longest [`EncoderProcess::close`] waits for queued frames to drain and the
/// child to exit. Covers trailer writing for long encodes.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(60);

/// Poll interval while closing.
const CLOSE_POLL: Duration = Duration::from_millis(10);

/// Lifecycle of one encoder job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum JobState {
    Starting = 0,
    Writing = 1,
    Closing = 2,
    Finished = 3,
    Errored = 4,
    Cancelled = 5,
}

impl JobState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => JobState::Starting,
            1 => JobState::Writing,
            2 => JobState::Closing,
            3 => JobState::Finished,
            5 => JobState::Cancelled,
            _ => JobState::Errored,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Finished | JobState::Errored | JobState::Cancelled
        )
    }
}

/// Errors from an encoder process.
#[derive(Debug, thiserror::Error)]
pub enum EncoderError {
    #[error("failed to start {program}: {source}")]
    Start {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("encoder did not accept a frame within {0:?}")]
    WriteTimeout(Duration),
    #[error("encoder pipe closed: {stderr}")]
    PipeClosed { stderr: String },
    #[error("encoder exited with {status}: {stderr}")]
    Failed { status: ExitStatus, stderr: String },
    #[error("encoder was cancelled")]
    Cancelled,
    #[error("encoder is not accepting frames (state {0:?})")]
    NotWriting(JobState),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("I/O error talking to encoder: {0}")]
    Io(#[from] std::io::Error),
}

struct Shared {
    state: AtomicU8,
    writer_failed: AtomicBool,
    stderr: Mutex<VecDeque<u8>>,
}

impl Shared {
    fn set_state(&self, state: JobState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn state(&self) -> JobState {
        JobState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn stderr_tail(&self) -> String {
        match self.stderr.lock() {
            Ok(tail) => {
                let (a, b) = tail.as_slices();
                let mut bytes = Vec::with_capacity(a.len() + b.len());
                bytes.extend_from_slice(a);
                bytes.extend_from_slice(b);
                String::from_utf8_lossy(&bytes).trim().to_string()
            }
            Err(_) => String::new(),
        }
    }
}

/// A running encoder child process that accepts raw frames on stdin.
pub struct EncoderProcess {
    child: Child,
    frames: Option<Sender<Vec<u8>>>,
    free: Receiver<Vec<u8>>,
    writer: Option<JoinHandle<()>>,
    stderr_reader: Option<JoinHandle<()>>,
    shared: Arc<Shared>,
    command: String,
}

impl EncoderProcess {
    /// Spawn `command` with piped stdin.
    pub fn start(command: &EncoderCommand) -> Result<Self, EncoderError> {
        let mut process = command.to_command();
        Self::spawn(&mut process, command.to_string())
    }

    fn spawn(process: &mut Command, description: String) -> Result<Self, EncoderError> {
        let shared = Arc::new(Shared {
            state: AtomicU8::new(JobState::Starting as u8),
            writer_failed: AtomicBool::new(false),
            stderr: Mutex::new(VecDeque::with_capacity(STDERR_TAIL_BYTES)),
        });

        let mut child = process
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| EncoderError::Start {
                program: description.clone(),
                source,
            })?;
        log::info!("Started encoder: {description}");

        let stdin = child.stdin.take().ok_or_else(|| EncoderError::Start {
            program: description.clone(),
            source: std::io::Error::other("stdin was not piped"),
        })?;

        let stderr_reader = match child.stderr.take() {
            Some(stderr) => {
                let shared = Arc::clone(&shared);
                Some(
                    thread::Builder::new()
                        .name("encoder-stderr".to_string())
                        .spawn(move || collect_stderr(stderr, &shared))?,
                )
            }
            None => None,
        };

        let (frames_tx, frames_rx) = channel::bounded::<Vec<u8>>(QUEUED_FRAMES);
        let (free_tx, free_rx) = channel::bounded::<Vec<u8>>(QUEUED_FRAMES + 1);
        let writer_shared = Arc::clone(&shared);
        let writer = match thread::Builder::new()
            .name("encoder-writer".to_string())
            .spawn(move || write_frames(stdin, frames_rx, free_tx, &writer_shared))
        {
            Ok(handle) => handle,
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(e.into());
            }
        };

        shared.set_state(JobState::Writing);
        Ok(Self {
            child,
            frames: Some(frames_tx),
            free: free_rx,
            writer: Some(writer),
            stderr_reader,
            shared,
            command: description,
        })
    }

    pub fn state(&self) -> JobState {
        self.shared.state()
    }

    /// The last few KiB the child wrote to stderr.
    pub fn stderr_tail(&self) -> String {
        self.shared.stderr_tail()
    }

    /// Queue one frame. Returns the number of bytes accepted: `bytes.len()`,
    /// or 0 when the encoder did not take the frame within `timeout` or is no
    /// longer running. Callers treat 0 as fatal.
    pub fn write(&mut self, bytes: &[u8], timeout: Duration) -> usize {
        if self.state() != JobState::Writing || self.shared.writer_failed.load(Ordering::Acquire)
        {
            return 0;
        }
        let Some(frames) = &self.frames else {
            return 0;
        };

        let mut buffer = self.free.try_recv().unwrap_or_default();
        buffer.clear();
        buffer.extend_from_slice(bytes);

        match frames.send_timeout(buffer, timeout) {
            Ok(()) => bytes.len(),
            Err(SendTimeoutError::Timeout(_)) => {
                log::warn!("Encoder did not accept a frame within {timeout:?}");
                0
            }
            Err(SendTimeoutError::Disconnected(_)) => 0,
        }
    }

    /// Like [`EncoderProcess::write`], with the reason for a refused frame.
    pub fn write_frame(&mut self, bytes: &[u8], timeout: Duration) -> Result<(), EncoderError> {
        let state = self.state();
        if state != JobState::Writing {
            return Err(EncoderError::NotWriting(state));
        }
        if self.write(bytes, timeout) == bytes.len() {
            return Ok(());
        }
        if self.shared.writer_failed.load(Ordering::Acquire) {
            Err(EncoderError::PipeClosed {
                stderr: self.stderr_tail(),
            })
        } else {
            Err(EncoderError::WriteTimeout(timeout))
        }
    }

    /// Flush queued frames, close stdin and wait for the child to exit.
    /// Gives up after [`CLOSE_TIMEOUT`].
    pub fn close(self) -> Result<(), EncoderError> {
        self.close_within(CLOSE_TIMEOUT)
    }

    /// Like [`EncoderProcess::close`] with an explicit bound. On expiry the
    /// child is killed and [`EncoderError::Timeout`] returned.
    pub fn close_within(mut self, timeout: Duration) -> Result<(), EncoderError> {
        self.shared.set_state(JobState::Closing);
        self.frames.take();

        let deadline = Instant::now() + timeout;
        let status = loop {
            let drained = self.writer.as_ref().map_or(true, JoinHandle::is_finished);
            if drained {
                if let Some(status) = self.child.try_wait()? {
                    break status;
                }
            }
            if Instant::now() >= deadline {
                log::error!("Encoder did not finish within {timeout:?}: {}", self.command);
                self.kill(JobState::Errored);
                return Err(EncoderError::Timeout(timeout));
            }
            thread::sleep(CLOSE_POLL);
        };
        self.join_writer();
        self.join_stderr();

        if status.success() {
            self.shared.set_state(JobState::Finished);
            log::info!("Encoder finished: {}", self.command);
            Ok(())
        } else {
            self.shared.set_state(JobState::Errored);
            let stderr = self.stderr_tail();
            log::error!("Encoder exited with {status}: {stderr}");
            Err(EncoderError::Failed { status, stderr })
        }
    }

    /// Kill the child and discard queued frames.
    pub fn cancel(mut self) {
        self.kill(JobState::Cancelled);
    }

    fn kill(&mut self, state: JobState) {
        if self.state().is_terminal() {
            return;
        }
        self.shared.set_state(state);
        self.frames.take();
        // Kill first: the writer may be blocked in a write to a full pipe.
        let _ = self.child.kill();
        let _ = self.child.wait();
        self.join_writer();
        self.join_stderr();
        log::info!("Encoder stopped ({state:?}): {}", self.command);
    }

    fn join_writer(&mut self) {
        if let Some(writer) = self.writer.take() {
            if writer.join().is_err() {
                log::error!("Encoder writer thread panicked");
            }
        }
    }

    fn join_stderr(&mut self) {
        if let Some(reader) = self.stderr_reader.take() {
            let _ = reader.join();
        }
    }
}

impl Drop for EncoderProcess {
    fn drop(&mut self) {
        self.kill(JobState::Cancelled);
    }
}

fn write_frames(
    mut stdin: ChildStdin,
    frames: Receiver<Vec<u8>>,
    free: Sender<Vec<u8>>,
    shared: &Shared,
) {
    for frame in frames.iter() {
        if let Err(e) = stdin.write_all(&frame) {
            log::warn!("Encoder stdin write failed: {e}");
            shared.writer_failed.store(true, Ordering::Release);
            return;
        }
        let _ = free.try_send(frame);
    }
    if let Err(e) = stdin.flush() {
        log::debug!("Encoder stdin flush failed: {e}");
    }
    // Dropping stdin signals end of input.
}

fn collect_stderr(mut stderr: impl Read, shared: &Shared) {
    let mut chunk = [0u8; 1024];
    loop {
        match stderr.read(&mut chunk) {
            Ok(0) | Err(_) => return,
            Ok(n) => {
                if let Ok(mut tail) = shared.stderr.lock() {
                    tail.extend(&chunk[..n]);
                    let excess = tail.len().saturating_sub(STDERR_TAIL_BYTES);
                    tail.drain(..excess);
                }
            }
        }
    }
}

/// Output of a short-lived helper process.
#[derive(Debug)]
pub struct BoundedOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

/// Run `command` to completion, killing it after `timeout` or as soon as
/// `cancel` is set.
pub fn run_bounded(
    command: &EncoderCommand,
    timeout: Duration,
    cancel: Option<&AtomicBool>,
) -> Result<BoundedOutput, EncoderError> {
    let mut child = command
        .to_command()
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| EncoderError::Start {
            program: command.program.display().to_string(),
            source,
        })?;

    let stdout = child.stdout.take().map(spawn_reader);
    let stderr = child.stderr.take().map(spawn_reader);

    let deadline = Instant::now() + timeout;
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break Some(status);
        }
        if cancel.is_some_and(|flag| flag.load(Ordering::Relaxed)) {
            break None;
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            return Err(EncoderError::Timeout(timeout));
        }
        thread::sleep(EXIT_POLL);
    };

    let Some(status) = status else {
        let _ = child.kill();
        let _ = child.wait();
        return Err(EncoderError::Cancelled);
    };

    let stdout = stdout.and_then(|h| h.join().ok()).unwrap_or_default();
    let stderr = stderr.and_then(|h| h.join().ok()).unwrap_or_default();
    Ok(BoundedOutput {
        status,
        stdout,
        stderr,
    })
}

fn spawn_reader(mut pipe: impl Read + Send + 'static) -> JoinHandle<String> {
    thread::spawn(move || {
        let mut bytes = Vec::new();
        let _ = pipe.read_to_end(&mut bytes);
        String::from_utf8_lossy(&bytes).into_owned()
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> EncoderCommand {
        EncoderCommand::new("sh").args(["-c", script])
    }

    #[test]
    fn test_write_to_stalled_process_times_out() {
        // `sleep` never reads stdin, so the pipe fills and stays full.
        let mut process = EncoderProcess::start(&EncoderCommand::new("sleep").arg("5")).unwrap();
        let frame = vec![0u8; 1 << 20];
        let timeout = Duration::from_millis(250);

        let mut accepted = 0;
        let mut elapsed = Duration::ZERO;
        for _ in 0..16 {
            let start = Instant::now();
            let written = process.write(&frame, timeout);
            elapsed = start.elapsed();
            if written == 0 {
                break;
            }
            accepted += 1;
        }

        assert!(accepted < 16, "pipe never filled");
        assert!(elapsed >= Duration::from_millis(200), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(300), "{elapsed:?}");
        assert_eq!(process.state(), JobState::Writing);
        process.cancel();
    }

    #[test]
    fn test_close_waits_for_exit() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("frames.raw");
        let script = format!("cat > '{}'", out.display());
        let mut process = EncoderProcess::start(&sh(&script)).unwrap();

        for i in 0..5u8 {
            assert_eq!(process.write(&[i; 64], Duration::from_secs(1)), 64);
        }
        process.close().unwrap();

        let written = std::fs::read(&out).unwrap();
        assert_eq!(written.len(), 5 * 64);
        assert_eq!(written[64 * 4], 4);
    }

    #[test]
    fn test_close_gives_up_on_stalled_encoder() {
        let mut process = EncoderProcess::start(&EncoderCommand::new("sleep").arg("5")).unwrap();
        // Fill the pipe so the writer thread is stuck in a write.
        let frame = vec![0u8; 1 << 20];
        for _ in 0..16 {
            if process.write(&frame, Duration::from_millis(100)) == 0 {
                break;
            }
        }

        let start = Instant::now();
        let result = process.close_within(Duration::from_millis(300));
        assert!(matches!(result, Err(EncoderError::Timeout(_))), "{result:?}");
        assert!(start.elapsed() < Duration::from_secs(2), "{:?}", start.elapsed());
    }

    #[test]
    fn test_failed_exit_reports_stderr_tail() {
        let process = EncoderProcess::start(&sh("cat > /dev/null; echo 'bad encoder' >&2; exit 3"))
            .unwrap();
        match process.close() {
            Err(EncoderError::Failed { stderr, .. }) => assert_eq!(stderr, "bad encoder"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_write_after_child_exit_fails() {
        let mut process = EncoderProcess::start(&sh("exit 0")).unwrap();
        let frame = vec![0u8; 1 << 16];
        let mut result = Ok(());
        for _ in 0..50 {
            result = process.write_frame(&frame, Duration::from_millis(100));
            if result.is_err() {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert!(matches!(
            result,
            Err(EncoderError::PipeClosed { .. }) | Err(EncoderError::WriteTimeout(_))
        ));
    }

    #[test]
    fn test_start_failure() {
        let result = EncoderProcess::start(&EncoderCommand::new("/nonexistent/encoder"));
        assert!(matches!(result, Err(EncoderError::Start { .. })));
    }

    #[test]
    fn test_run_bounded_kills_on_timeout() {
        let start = Instant::now();
        let result = run_bounded(
            &EncoderCommand::new("sleep").arg("5"),
            Duration::from_millis(200),
            None,
        );
        assert!(matches!(result, Err(EncoderError::Timeout(_))));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_run_bounded_captures_output() {
        let output = run_bounded(
            &sh("echo out; echo err >&2"),
            Duration::from_secs(5),
            None,
        )
        .unwrap();
        assert!(output.status.success());
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
    }

    #[test]
    fn test_run_bounded_observes_cancel() {
        let cancel = AtomicBool::new(true);
        let result = run_bounded(
            &EncoderCommand::new("sleep").arg("5"),
            Duration::from_secs(5),
            Some(&cancel),
        );
        assert!(matches!(result, Err(EncoderError::Cancelled)));
    }
}
