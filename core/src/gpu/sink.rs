//! Where finished frames go.
//!
//! Sinks run on the render thread. GPU-side work (mirroring into another
//! texture) is recorded into the frame's command encoder; host-side work
//! receives the read-back pixels.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use wgpu::{CommandEncoder, Device, TextureUsages};

use super::textures::{CapturedFrame, RenderTarget, RowOrder, OUTPUT_FORMAT};

/// Consumer of composited frames.
pub trait FrameSink: Send {
    fn name(&self) -> &str;

    /// Whether this sink wants host pixels through [`FrameSink::deliver`].
    fn needs_readback(&self) -> bool {
        false
    }

    /// Record GPU work against the composited output.
    fn encode(&mut self, _device: &Device, _encoder: &mut CommandEncoder, _output: &RenderTarget) {}

    /// Receive the read-back frame, rows top-down.
    fn deliver(&mut self, _frame: &CapturedFrame) {}

    /// A closed sink is removed by its owner.
    fn is_closed(&self) -> bool {
        false
    }
}

/// Copies frames to host memory and hands them to a bounded channel.
///
/// The render thread never waits on the receiver: when the channel is full the
/// frame is counted in [`CaptureSink::dropped`] instead.
pub struct CaptureSink {
    sender: Sender<CapturedFrame>,
    row_order: RowOrder,
    dropped: Arc<AtomicU64>,
    closed: bool,
}

impl CaptureSink {
    pub fn new(capacity: usize) -> (Self, Receiver<CapturedFrame>) {
        let (sender, receiver) = channel::bounded(capacity.max(1));
        let sink = Self {
            sender,
            row_order: RowOrder::TopDown,
            dropped: Arc::new(AtomicU64::new(0)),
            closed: false,
        };
        (sink, receiver)
    }

    /// Deliver rows in `order` instead of top-down.
    pub fn with_row_order(mut self, order: RowOrder) -> Self {
        self.row_order = order;
        self
    }

    /// Counter of frames the receiver was too slow to take.
    pub fn dropped(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.dropped)
    }
}

impl FrameSink for CaptureSink {
    fn name(&self) -> &str {
        "capture"
    }

    fn needs_readback(&self) -> bool {
        true
    }

    fn deliver(&mut self, frame: &CapturedFrame) {
        let frame = frame.clone().into_row_order(self.row_order);
        match self.sender.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Disconnected(_)) => {
                log::debug!("Capture receiver gone, closing sink");
                self.closed = true;
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

/// Copies each frame on the GPU into a texture the host owns, for on-screen
/// display or a shared external output.
pub struct MirrorSink {
    target: Arc<RenderTarget>,
    frames: Arc<AtomicU64>,
    warned: bool,
}

impl MirrorSink {
    pub fn new(device: &Device, width: u32, height: u32) -> Self {
        let target = RenderTarget::new(
            device,
            "mirror_target",
            width,
            height,
            OUTPUT_FORMAT,
            TextureUsages::COPY_DST | TextureUsages::COPY_SRC | TextureUsages::TEXTURE_BINDING,
        );
        Self {
            target: Arc::new(target),
            frames: Arc::new(AtomicU64::new(0)),
            warned: false,
        }
    }

    /// The texture frames are mirrored into.
    pub fn target(&self) -> Arc<RenderTarget> {
        Arc::clone(&self.target)
    }

    /// Counter of frames mirrored so far.
    pub fn frames(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.frames)
    }
}

impl FrameSink for MirrorSink {
    fn name(&self) -> &str {
        "mirror"
    }

    fn encode(&mut self, _device: &Device, encoder: &mut CommandEncoder, output: &RenderTarget) {
        if output.size() != self.target.size() {
            if !self.warned {
                log::warn!(
                    "Mirror target is {:?} but output is {:?}; skipping",
                    self.target.size(),
                    output.size()
                );
                self.warned = true;
            }
            return;
        }
        encoder.copy_texture_to_texture(
            wgpu::TexelCopyTextureInfo {
                texture: output.texture(),
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyTextureInfo {
                texture: self.target.texture(),
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            output.extent(),
        );
        self.frames.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(sequence: u64) -> CapturedFrame {
        CapturedFrame {
            width: 1,
            height: 2,
            row_order: RowOrder::TopDown,
            pixels: vec![10, 10, 10, 255, 20, 20, 20, 255],
            sequence,
        }
    }

    #[test]
    fn test_capture_sink_counts_drops_when_full() {
        let (mut sink, receiver) = CaptureSink::new(1);
        let dropped = sink.dropped();
        sink.deliver(&frame(0));
        sink.deliver(&frame(1));
        sink.deliver(&frame(2));

        assert_eq!(dropped.load(Ordering::Relaxed), 2);
        assert_eq!(receiver.try_recv().unwrap().sequence, 0);
        assert!(!sink.is_closed());
    }

    #[test]
    fn test_capture_sink_applies_row_order() {
        let (sink, receiver) = CaptureSink::new(1);
        let mut sink = sink.with_row_order(RowOrder::BottomUp);
        sink.deliver(&frame(0));

        let delivered = receiver.try_recv().unwrap();
        assert_eq!(delivered.row_order, RowOrder::BottomUp);
        assert_eq!(&delivered.pixels[..4], &[20, 20, 20, 255]);
    }

    #[test]
    fn test_capture_sink_closes_without_receiver() {
        let (mut sink, receiver) = CaptureSink::new(1);
        drop(receiver);
        sink.deliver(&frame(0));
        assert!(sink.is_closed());
    }
}
