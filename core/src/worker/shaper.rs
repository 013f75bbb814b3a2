//! The worker task that turns bus blocks into beam frames for the renderer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam::channel::{Sender, TrySendError};

use crate::audio::bus::AudioBlock;
use crate::audio::points::{BeamFrame, BeamPoint, PointShaper};

use super::worker::{StreamConfig, WorkerTask};

/// Destination for finished beam frames.
pub trait PointSink: Send {
    /// Hand over a frame. Returns false if it was not accepted.
    fn submit(&mut self, frame: BeamFrame) -> bool;
}

impl PointSink for Sender<BeamFrame> {
    fn submit(&mut self, frame: BeamFrame) -> bool {
        match self.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => false,
        }
    }
}

/// Resamples every block to the point rate and emits one [`BeamFrame`] per
/// video frame interval.
pub struct BeamShaper<S: PointSink> {
    sink: S,
    frame_rate: f64,
    point_rate: f64,
    shaper: Option<PointShaper>,
    pending: Vec<BeamPoint>,
    samples_per_frame: usize,
    accumulated: usize,
    sequence: u64,
    dropped_frames: Arc<AtomicU64>,
}

impl<S: PointSink> BeamShaper<S> {
    pub fn new(sink: S, frame_rate: f64, point_rate: f64) -> Self {
        Self {
            sink,
            frame_rate: frame_rate.max(1.0),
            point_rate,
            shaper: None,
            pending: Vec::new(),
            samples_per_frame: 1,
            accumulated: 0,
            sequence: 0,
            dropped_frames: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Share a counter of frames the sink refused.
    pub fn with_drop_counter(mut self, counter: Arc<AtomicU64>) -> Self {
        self.dropped_frames = counter;
        self
    }

    fn emit(&mut self) {
        let frame = BeamFrame {
            points: std::mem::take(&mut self.pending),
            point_rate: self.point_rate as f32,
            sequence: self.sequence,
        };
        self.sequence += 1;
        if !self.sink.submit(frame) {
            self.dropped_frames.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl<S: PointSink> WorkerTask for BeamShaper<S> {
    fn prepare(&mut self, config: &StreamConfig) {
        self.shaper = Some(PointShaper::new(
            config.channels,
            config.sample_rate,
            self.point_rate,
        ));
        self.samples_per_frame = ((config.sample_rate / self.frame_rate).round() as usize).max(1);
        self.accumulated = 0;
        self.pending.clear();
    }

    fn process(&mut self, block: &AudioBlock) {
        let Some(shaper) = self.shaper.as_mut() else {
            return;
        };
        shaper.shape_into(block.samples(), &mut self.pending);
        self.accumulated += block.frames();

        if self.accumulated >= self.samples_per_frame {
            self.accumulated %= self.samples_per_frame;
            self.emit();
        }
    }

    fn stop(&mut self) {
        if !self.pending.is_empty() {
            self.emit();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::bus::{BusShape, SampleBus};
    use crossbeam::channel::bounded;
    use std::time::Duration;

    #[test]
    fn test_emits_one_frame_per_interval() {
        let (tx, rx) = bounded(16);
        let mut shaper = BeamShaper::new(tx, 60.0, 192_000.0);
        shaper.prepare(&StreamConfig {
            sample_rate: 48_000.0,
            block_frames: 400,
            channels: 2,
        });

        // 800 frames per video frame at 48 kHz / 60 fps.
        let shape = BusShape::new(2, 400).with_queue_depth(16);
        let (bus, mut publisher) = SampleBus::new(shape);
        let mut consumer = bus.register_consumer();
        for _ in 0..4 {
            publisher.publish(&vec![0.1; shape.block_len()]);
            let block = consumer.read(Duration::ZERO).unwrap();
            shaper.process(block);
        }

        let frames: Vec<BeamFrame> = rx.try_iter().collect();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].sequence, 0);
        assert_eq!(frames[1].sequence, 1);
        assert!(!frames[1].points.is_empty());
        assert_eq!(frames[0].point_rate, 192_000.0);
    }

    #[test]
    fn test_full_sink_counts_dropped_frames() {
        let (tx, _rx) = bounded(1);
        let dropped = Arc::new(AtomicU64::new(0));
        let mut shaper = BeamShaper::new(tx, 60.0, 48_000.0).with_drop_counter(dropped.clone());
        shaper.prepare(&StreamConfig {
            sample_rate: 48_000.0,
            block_frames: 800,
            channels: 2,
        });

        let shape = BusShape::new(2, 800);
        let (bus, mut publisher) = SampleBus::new(shape);
        let mut consumer = bus.register_consumer();
        for _ in 0..3 {
            publisher.publish(&vec![0.0; shape.block_len()]);
            shaper.process(consumer.read(Duration::ZERO).unwrap());
        }

        assert_eq!(dropped.load(Ordering::Relaxed), 2);
    }
}
