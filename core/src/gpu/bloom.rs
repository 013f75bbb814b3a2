//! Glow: a chain of progressively smaller blurred copies of the line image.
//!
//! Each level downsamples the previous one, then blurs horizontally and
//! vertically. Every pass owns its uniform buffer and bind group, built once
//! per target set, so no pass can observe another pass's parameters.

use wgpu::util::DeviceExt;
use wgpu::{BindGroup, BindGroupLayout, CommandEncoder, Device, RenderPipeline, Sampler};

use super::layouts::MAX_BLOOM_LEVELS;
use super::textures::RenderTarget;

/// Smallest level edge in pixels.
pub const MIN_BLOOM_SIZE: u32 = 8;

/// Blur tap spacing in source texels.
const BLUR_SPREAD: f32 = 1.5;

#[repr(C)]
#[derive(Copy, Clone, Debug, bytemuck::Pod, bytemuck::Zeroable)]
struct FilterUniforms {
    direction: [f32; 2],
    texel: [f32; 2],
    spread: f32,
    _padding: [f32; 3],
}

/// Weight of each level in the composite. Halves per level and sums to one
/// over the configured levels; unused slots are zero.
pub fn bloom_weights(levels: usize) -> [f32; MAX_BLOOM_LEVELS] {
    let levels = levels.clamp(1, MAX_BLOOM_LEVELS);
    let mut weights = [0.0; MAX_BLOOM_LEVELS];
    let mut total = 0.0;
    for (i, weight) in weights.iter_mut().take(levels).enumerate() {
        *weight = 0.5f32.powi(i as i32);
        total += *weight;
    }
    for weight in &mut weights {
        *weight /= total;
    }
    weights
}

/// Level edge lengths for a given output resolution. Levels never exceed the
/// output and never grow along the chain.
pub fn level_sizes(requested: &[u32], resolution: u32) -> Vec<u32> {
    let mut sizes = Vec::with_capacity(requested.len());
    let mut previous = resolution;
    for &size in requested.iter().take(MAX_BLOOM_LEVELS) {
        let size = size.clamp(MIN_BLOOM_SIZE, previous.max(MIN_BLOOM_SIZE));
        sizes.push(size);
        previous = size;
    }
    sizes
}

struct FilterPass {
    bind_group: BindGroup,
    // Kept alive for the bind group.
    _uniforms: wgpu::Buffer,
}

impl FilterPass {
    fn new(
        device: &Device,
        layout: &BindGroupLayout,
        sampler: &Sampler,
        source: &RenderTarget,
        direction: [f32; 2],
        label: &str,
    ) -> Self {
        let (w, h) = source.size();
        let uniforms = FilterUniforms {
            direction,
            texel: [1.0 / w as f32, 1.0 / h as f32],
            spread: BLUR_SPREAD,
            _padding: [0.0; 3],
        };
        let buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(label),
            contents: bytemuck::bytes_of(&uniforms),
            usage: wgpu::BufferUsages::UNIFORM,
        });
        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(label),
            layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(source.view()),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::Sampler(sampler),
                },
            ],
        });
        Self {
            bind_group,
            _uniforms: buffer,
        }
    }
}

struct BloomLevel {
    /// Downsampled, then vertically blurred: the level's result.
    target: RenderTarget,
    /// Horizontal blur output.
    scratch: RenderTarget,
    downsample: FilterPass,
    blur_h: FilterPass,
    blur_v: FilterPass,
}

/// The bloom targets and passes for one output resolution.
pub struct BloomChain {
    levels: Vec<BloomLevel>,
}

impl BloomChain {
    /// Build levels of `sizes` pixels fed from `source`.
    pub fn new(
        device: &Device,
        filter_layout: &BindGroupLayout,
        sampler: &Sampler,
        source: &RenderTarget,
        sizes: &[u32],
    ) -> Self {
        let mut levels: Vec<BloomLevel> = Vec::with_capacity(sizes.len());
        for (i, &size) in sizes.iter().enumerate() {
            let target = RenderTarget::for_scene(device, &format!("bloom_{i}"), size, size);
            let scratch =
                RenderTarget::for_scene(device, &format!("bloom_{i}_scratch"), size, size);
            let input = match levels.last() {
                Some(previous) => &previous.target,
                None => source,
            };
            let downsample = FilterPass::new(
                device,
                filter_layout,
                sampler,
                input,
                [0.0, 0.0],
                "bloom_downsample",
            );
            let blur_h = FilterPass::new(
                device,
                filter_layout,
                sampler,
                &target,
                [1.0, 0.0],
                "bloom_blur_h",
            );
            let blur_v = FilterPass::new(
                device,
                filter_layout,
                sampler,
                &scratch,
                [0.0, 1.0],
                "bloom_blur_v",
            );
            levels.push(BloomLevel {
                target,
                scratch,
                downsample,
                blur_h,
                blur_v,
            });
        }
        Self { levels }
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    /// Result targets, largest first.
    pub fn targets(&self) -> impl Iterator<Item = &RenderTarget> {
        self.levels.iter().map(|level| &level.target)
    }

    /// Record every level's passes.
    pub fn encode(
        &self,
        encoder: &mut CommandEncoder,
        downsample: &RenderPipeline,
        blur: &RenderPipeline,
    ) {
        for level in &self.levels {
            run_pass(encoder, "bloom_downsample", downsample, &level.downsample, &level.target);
            run_pass(encoder, "bloom_blur_h", blur, &level.blur_h, &level.scratch);
            run_pass(encoder, "bloom_blur_v", blur, &level.blur_v, &level.target);
        }
    }
}

fn run_pass(
    encoder: &mut CommandEncoder,
    label: &str,
    pipeline: &RenderPipeline,
    pass: &FilterPass,
    output: &RenderTarget,
) {
    let mut render_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
        label: Some(label),
        color_attachments: &[Some(wgpu::RenderPassColorAttachment {
            view: output.view(),
            resolve_target: None,
            depth_slice: None,
            ops: wgpu::Operations {
                load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                store: wgpu::StoreOp::Store,
            },
        })],
        depth_stencil_attachment: None,
        timestamp_writes: None,
        occlusion_query_set: None,
        multiview_mask: None,
    });
    render_pass.set_pipeline(pipeline);
    render_pass.set_bind_group(0, &pass.bind_group, &[]);
    render_pass.draw(0..3, 0..1);
}
