//! GPU rendering using wgpu.
//!
//! Simulates a CRT oscilloscope screen: phosphor fade, an analytically
//! integrated beam profile per segment, multi-level bloom and a tone-mapped
//! composite with a screen overlay. The render thread owns every GPU
//! resource; other threads talk to it through a [`RenderClient`].

pub mod beam;
pub mod bloom;
pub mod compositor;
pub mod context;
pub mod layouts;
pub mod overlay;
pub mod params;
pub mod pipelines;
pub mod render_thread;
pub mod sink;
pub mod textures;
pub mod transform;

pub use beam::{
    afterglow_fade, fade_amount, half_life_seconds, segment_intensity, shutter_gain, BeamProfile,
};
pub use compositor::{Compositor, CompositorConfig, RenderedFrame};
pub use context::{GpuContext, GpuError};
pub use overlay::generate_overlay;
pub use params::{RenderParameters, ScreenOverlay, SharedRenderParameters};
pub use render_thread::{Readiness, RenderClient, RenderCommand, RenderRequestError, RenderThread};
pub use sink::{CaptureSink, FrameSink, MirrorSink};
pub use textures::{CapturedFrame, RenderTarget, RowOrder};
pub use transform::PointTransform;
