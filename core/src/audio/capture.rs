//! Recording the live audio stream to disk.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use thiserror::Error;

use super::bus::{ReadError, SampleBus};

const POLL: Duration = Duration::from_millis(50);

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("failed to write WAV: {0}")]
    Wav(#[from] hound::Error),

    #[error("capture thread panicked")]
    Panicked,
}

/// Result of a finished capture.
#[derive(Debug, Clone)]
pub struct CapturedAudio {
    pub path: PathBuf,
    pub frames: u64,
    /// Blocks the capture missed because it fell behind.
    pub dropped_blocks: u64,
}

/// A bus consumer that writes every block it receives to a float WAV file.
pub struct WavCapture {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<Result<CapturedAudio, CaptureError>>>,
}

impl WavCapture {
    /// Register on `bus` and start writing to `path`.
    pub fn start(bus: &SampleBus, sample_rate: u32, path: &Path) -> Result<Self, CaptureError> {
        let shape = bus.shape();
        let spec = hound::WavSpec {
            channels: shape.channels as u16,
            sample_rate,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let mut writer = hound::WavWriter::create(path, spec)?;
        // Deep queue: the writer only touches the disk.
        let mut consumer = bus.register_consumer_with_depth(shape.queue_depth.max(64));
        let stop = Arc::new(AtomicBool::new(false));
        let path = path.to_path_buf();

        let thread_stop = stop.clone();
        let thread = std::thread::Builder::new()
            .name("wav-capture".into())
            .spawn(move || {
                let mut frames = 0u64;
                loop {
                    match consumer.read(POLL) {
                        Ok(block) => {
                            for &sample in block.samples() {
                                writer.write_sample(sample)?;
                            }
                            frames += block.frames() as u64;
                        }
                        Err(ReadError::TimedOut) => {}
                        Err(ReadError::Closed) => break,
                    }
                    consumer.mark_consumed();
                    if thread_stop.load(Ordering::Acquire) {
                        break;
                    }
                }

                let dropped_blocks = consumer.dropped();
                if dropped_blocks > 0 {
                    log::warn!("audio capture fell behind and lost {dropped_blocks} blocks");
                }
                writer.finalize()?;
                Ok(CapturedAudio {
                    path,
                    frames,
                    dropped_blocks,
                })
            })
            .map_err(|e| CaptureError::Wav(hound::Error::IoError(e)))?;

        Ok(Self {
            stop,
            thread: Some(thread),
        })
    }

    /// Stop capturing and finalise the file.
    pub fn finish(mut self) -> Result<CapturedAudio, CaptureError> {
        self.stop.store(true, Ordering::Release);
        match self.thread.take() {
            Some(thread) => thread.join().map_err(|_| CaptureError::Panicked)?,
            None => Err(CaptureError::Panicked),
        }
    }
}

impl Drop for WavCapture {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::bus::BusShape;

    #[test]
    fn test_capture_writes_published_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.wav");

        let shape = BusShape::new(2, 256);
        let (bus, mut publisher) = SampleBus::new(shape);
        let capture = WavCapture::start(&bus, 48000, &path).unwrap();

        for _ in 0..10 {
            publisher.publish(&vec![0.25; shape.block_len()]);
        }
        // Let the capture thread drain its queue before stopping.
        std::thread::sleep(Duration::from_millis(200));

        let captured = capture.finish().unwrap();
        assert_eq!(captured.frames, 2560);

        let reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.spec().channels, 2);
        assert_eq!(reader.spec().sample_rate, 48000);
        assert_eq!(reader.len(), 5120);
    }
}
