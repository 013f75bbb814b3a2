//! The CRT compositor: fade, line draw, bloom and composite.
//!
//! One [`Compositor::render_frame`] call produces one output image. Changes to
//! resolution or overlay are applied at the start of a frame, before any pass
//! is recorded. Points pass through a [`PointTransform`] (sweep, flips,
//! goniometer) on their way into the vertex buffer. Each stage is submitted inside its own validation scope: a
//! failed bloom stage is logged and the frame continues with stale glow, while
//! a failed draw, composite or readback skips the frame entirely.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use wgpu::{BindGroup, BindGroupLayout, Buffer, RenderPipeline, Sampler};

use crate::audio::points::{BeamFrame, BeamPoint};

use super::beam::{fade_amount, shutter_gain, BeamProfile, MIN_SEGMENT_LENGTH};
use super::bloom::{bloom_weights, level_sizes, BloomChain};
use super::context::{GpuContext, GpuError};
use super::layouts::{
    create_composite_layout, create_filter_layout, create_uniform_layout, MAX_BLOOM_LEVELS,
};
use super::overlay::{generate_overlay, OVERLAY_SIZE};
use super::params::{RenderParameters, ScreenOverlay};
use super::pipelines::{
    create_fullscreen_pipeline, create_pipeline_layout, create_shader, RenderPipelineBuilder,
    ADDITIVE_BLEND,
};
use super::sink::FrameSink;
use super::textures::{
    CapturedFrame, ReadbackBuffer, RenderTarget, RowOrder, ACCUMULATION_FORMAT, OUTPUT_FORMAT,
};
use super::transform::PointTransform;

/// Smallest and largest output edge the compositor accepts.
pub const MIN_RESOLUTION: u32 = 16;
pub const MAX_RESOLUTION: u32 = 8192;

const FADE_SHADER: &str = concat!(
    include_str!("shaders/fullscreen.wgsl"),
    include_str!("shaders/fade.wgsl")
);
const LINE_SHADER: &str = include_str!("shaders/line.wgsl");
const FILTER_SHADER: &str = concat!(
    include_str!("shaders/fullscreen.wgsl"),
    include_str!("shaders/filter.wgsl")
);
const COMPOSITE_SHADER: &str = concat!(
    include_str!("shaders/fullscreen.wgsl"),
    include_str!("shaders/composite.wgsl")
);

/// Structural settings that need new GPU targets when they change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompositorConfig {
    /// Edge length of each bloom level in pixels, largest first. Two to four
    /// levels.
    pub bloom_levels: Vec<u32>,
}

impl Default for CompositorConfig {
    fn default() -> Self {
        Self {
            bloom_levels: vec![512, 128],
        }
    }
}

impl CompositorConfig {
    /// Bloom sizes clamped to the supported level count.
    fn sanitized_levels(&self) -> Vec<u32> {
        if (2..=MAX_BLOOM_LEVELS).contains(&self.bloom_levels.len()) {
            self.bloom_levels.clone()
        } else {
            log::warn!(
                "Unsupported bloom level count {}, using defaults",
                self.bloom_levels.len()
            );
            Self::default().bloom_levels
        }
    }
}

/// One beam point as the line shader reads it.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, bytemuck::Pod, bytemuck::Zeroable)]
pub struct LineVertex {
    /// x, y, brightness, unused.
    pub position: [f32; 4],
    /// rgb, and 1.0 in w when the colour overrides the beam hue.
    pub colour: [f32; 4],
}

impl From<&BeamPoint> for LineVertex {
    fn from(point: &BeamPoint) -> Self {
        let colour = match point.colour {
            Some([r, g, b]) => [r, g, b, 1.0],
            None => [0.0; 4],
        };
        Self {
            position: [point.x, point.y, point.z, 0.0],
            colour,
        }
    }
}

const VERTEX_STRIDE: u64 = std::mem::size_of::<LineVertex>() as u64;
const START_ATTRIBUTES: [wgpu::VertexAttribute; 2] =
    wgpu::vertex_attr_array![0 => Float32x4, 1 => Float32x4];
const END_ATTRIBUTES: [wgpu::VertexAttribute; 2] =
    wgpu::vertex_attr_array![2 => Float32x4, 3 => Float32x4];
const MIN_VERTEX_CAPACITY: usize = 1024;

#[repr(C)]
#[derive(Copy, Clone, Debug, bytemuck::Pod, bytemuck::Zeroable)]
struct FadeUniforms {
    amount: f32,
    afterglow: f32,
    _padding: [f32; 2],
}

#[repr(C)]
#[derive(Copy, Clone, Debug, bytemuck::Pod, bytemuck::Zeroable)]
struct LineUniforms {
    resolution: [f32; 2],
    size: f32,
    sigma: f32,
    energy: f32,
    min_length: f32,
    _padding: [f32; 2],
    colour: [f32; 4],
}

#[repr(C)]
#[derive(Copy, Clone, Debug, bytemuck::Pod, bytemuck::Zeroable)]
struct CompositeUniforms {
    screen: [f32; 4],
    bloom_weights: [f32; 4],
    glow: f32,
    exposure: f32,
    overexposure: f32,
    saturation: f32,
    noise: f32,
    seed: f32,
    _padding: [f32; 2],
}

/// What one rendered frame produced.
#[derive(Debug)]
pub struct RenderedFrame {
    pub sequence: u64,
    /// Present when a capture was requested.
    pub captured: Option<CapturedFrame>,
    /// False when the bloom stage failed and stale glow was composited.
    pub bloom_ok: bool,
}

struct Pipelines {
    fade: RenderPipeline,
    line: RenderPipeline,
    downsample: RenderPipeline,
    blur: RenderPipeline,
    composite: RenderPipeline,
    uniform_layout: BindGroupLayout,
    filter_layout: BindGroupLayout,
    composite_layout: BindGroupLayout,
    sampler: Sampler,
}

impl Pipelines {
    fn new(device: &wgpu::Device) -> Self {
        let uniform_layout = create_uniform_layout(device, "uniform_bind_group_layout");
        let filter_layout = create_filter_layout(device);
        let composite_layout = create_composite_layout(device);

        let uniform_pipeline_layout =
            create_pipeline_layout(device, "uniform_pipeline_layout", &[&uniform_layout]);
        let filter_pipeline_layout =
            create_pipeline_layout(device, "filter_pipeline_layout", &[&filter_layout]);
        let composite_pipeline_layout =
            create_pipeline_layout(device, "composite_pipeline_layout", &[&composite_layout]);

        let fade_shader = create_shader(device, "fade_shader", FADE_SHADER);
        let line_shader = create_shader(device, "line_shader", LINE_SHADER);
        let filter_shader = create_shader(device, "filter_shader", FILTER_SHADER);
        let composite_shader = create_shader(device, "composite_shader", COMPOSITE_SHADER);

        let fade = create_fullscreen_pipeline(
            device,
            "fade_pipeline",
            &filter_pipeline_layout,
            &fade_shader,
            "fs_main",
            ACCUMULATION_FORMAT,
            wgpu::BlendState::REPLACE,
        );

        let line = RenderPipelineBuilder::new("line_pipeline", &line_shader)
            .layout(&uniform_pipeline_layout)
            .vertex_buffers(vec![
                wgpu::VertexBufferLayout {
                    array_stride: VERTEX_STRIDE,
                    step_mode: wgpu::VertexStepMode::Instance,
                    attributes: &START_ATTRIBUTES,
                },
                wgpu::VertexBufferLayout {
                    array_stride: VERTEX_STRIDE,
                    step_mode: wgpu::VertexStepMode::Instance,
                    attributes: &END_ATTRIBUTES,
                },
            ])
            .format(ACCUMULATION_FORMAT)
            .blend(ADDITIVE_BLEND)
            .build(device);

        let downsample = create_fullscreen_pipeline(
            device,
            "downsample_pipeline",
            &filter_pipeline_layout,
            &filter_shader,
            "fs_downsample",
            ACCUMULATION_FORMAT,
            wgpu::BlendState::REPLACE,
        );
        let blur = create_fullscreen_pipeline(
            device,
            "blur_pipeline",
            &filter_pipeline_layout,
            &filter_shader,
            "fs_blur",
            ACCUMULATION_FORMAT,
            wgpu::BlendState::REPLACE,
        );
        let composite = create_fullscreen_pipeline(
            device,
            "composite_pipeline",
            &composite_pipeline_layout,
            &composite_shader,
            "fs_main",
            OUTPUT_FORMAT,
            wgpu::BlendState::REPLACE,
        );

        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("linear_sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            mipmap_filter: wgpu::MipmapFilterMode::Nearest,
            ..Default::default()
        });

        Self {
            fade,
            line,
            downsample,
            blur,
            composite,
            uniform_layout,
            filter_layout,
            composite_layout,
            sampler,
        }
    }
}

/// Everything sized by the output resolution.
struct Targets {
    resolution: u32,
    accumulation: RenderTarget,
    /// Last frame's accumulation, read by the fade pass.
    history: RenderTarget,
    bloom: BloomChain,
    output: RenderTarget,
    readback: ReadbackBuffer,
}

impl Targets {
    fn new(ctx: &GpuContext, pipelines: &Pipelines, resolution: u32, bloom_sizes: &[u32]) -> Self {
        let device = &ctx.device;
        let accumulation = RenderTarget::for_scene(device, "accumulation", resolution, resolution);
        let history = RenderTarget::for_scene(device, "history", resolution, resolution);
        let sizes = level_sizes(bloom_sizes, resolution);
        let bloom = BloomChain::new(
            device,
            &pipelines.filter_layout,
            &pipelines.sampler,
            &accumulation,
            &sizes,
        );
        let output = RenderTarget::for_output(device, "composite_output", resolution, resolution);
        let readback = ReadbackBuffer::new(device, resolution, resolution);
        log::info!("Compositor targets at {resolution}px, bloom levels {sizes:?}");
        Self {
            resolution,
            accumulation,
            history,
            bloom,
            output,
            readback,
        }
    }
}

/// Simulates a CRT oscilloscope screen on the GPU.
pub struct Compositor {
    ctx: Arc<GpuContext>,
    config: CompositorConfig,
    pipelines: Pipelines,
    targets: Targets,
    overlay_mode: ScreenOverlay,
    overlay: RenderTarget,
    black: RenderTarget,
    composite_bind_group: BindGroup,
    fade_uniforms: Buffer,
    fade_bind_group: BindGroup,
    line_uniforms: Buffer,
    line_bind_group: BindGroup,
    composite_uniforms: Buffer,
    vertex_buffer: Buffer,
    vertex_capacity: usize,
    vertices: Vec<LineVertex>,
    transform: PointTransform,
    locked_resolution: Option<u32>,
    frames_rendered: u64,
    #[cfg(test)]
    fault_bloom: bool,
}

impl Compositor {
    pub fn new(ctx: Arc<GpuContext>, params: &RenderParameters, config: CompositorConfig) -> Self {
        let device = &ctx.device;
        let pipelines = Pipelines::new(device);
        let resolution = clamp_resolution(params.resolution);
        let targets = Targets::new(&ctx, &pipelines, resolution, &config.sanitized_levels());

        let overlay = RenderTarget::for_upload(device, "overlay", OVERLAY_SIZE, OVERLAY_SIZE);
        overlay.upload_rgba(&ctx.queue, generate_overlay(params.overlay, OVERLAY_SIZE).as_raw());
        let black = RenderTarget::for_upload(device, "black", 1, 1);
        black.upload_rgba(&ctx.queue, &[0, 0, 0, 255]);

        let fade_uniforms = uniform_buffer::<FadeUniforms>(device, "fade_uniforms");
        let line_uniforms = uniform_buffer::<LineUniforms>(device, "line_uniforms");
        let composite_uniforms = uniform_buffer::<CompositeUniforms>(device, "composite_uniforms");
        let fade_bind_group = fade_bind_group(device, &pipelines, &targets, &fade_uniforms);
        let line_bind_group =
            uniform_bind_group(device, &pipelines.uniform_layout, &line_uniforms, "line");

        let composite_bind_group = composite_bind_group(
            device,
            &pipelines,
            &targets,
            &overlay,
            &black,
            &composite_uniforms,
        );

        let vertex_buffer = vertex_buffer(device, MIN_VERTEX_CAPACITY);

        Self {
            config,
            pipelines,
            targets,
            overlay_mode: params.overlay,
            overlay,
            black,
            composite_bind_group,
            fade_uniforms,
            fade_bind_group,
            line_uniforms,
            line_bind_group,
            composite_uniforms,
            vertex_buffer,
            vertex_capacity: MIN_VERTEX_CAPACITY,
            vertices: Vec::with_capacity(MIN_VERTEX_CAPACITY),
            transform: PointTransform::new(),
            locked_resolution: None,
            frames_rendered: 0,
            #[cfg(test)]
            fault_bloom: false,
            ctx,
        }
    }

    pub fn context(&self) -> &Arc<GpuContext> {
        &self.ctx
    }

    /// Current output edge in pixels.
    pub fn resolution(&self) -> u32 {
        self.targets.resolution
    }

    pub fn config(&self) -> &CompositorConfig {
        &self.config
    }

    pub fn frames_rendered(&self) -> u64 {
        self.frames_rendered
    }

    /// Pin the output size. While locked, the resolution parameter is
    /// ignored; `None` unlocks.
    pub fn lock_resolution(&mut self, resolution: Option<u32>) {
        self.locked_resolution = resolution.map(clamp_resolution);
    }

    pub fn locked_resolution(&self) -> Option<u32> {
        self.locked_resolution
    }

    /// Replace the structural config. Takes effect at the next frame start.
    pub fn reconfigure(&mut self, config: CompositorConfig) {
        if config != self.config {
            self.config = config;
            // Forces target rebuild.
            self.targets.resolution = 0;
        }
    }

    /// Render one frame from `frame`'s points.
    ///
    /// Sinks record their GPU work after the composite; if `capture` is set
    /// or any sink needs host pixels, the output is read back and delivered.
    /// An error means the frame was skipped and nothing was presented.
    pub fn render_frame(
        &mut self,
        frame: &BeamFrame,
        params: &RenderParameters,
        sinks: &mut [Box<dyn FrameSink>],
        capture: bool,
    ) -> Result<RenderedFrame, GpuError> {
        self.apply_frame_start(params);
        let resolution = self.targets.resolution;

        let mut profile = BeamProfile::new(params, resolution, frame.point_rate);
        if params.shutter_sync {
            profile.energy *= shutter_gain(frame.points.len(), frame.point_rate, params.frame_rate);
        }
        self.write_uniforms(params, &profile, resolution);
        let segments = self.upload_points(frame, params);

        let ctx = Arc::clone(&self.ctx);
        ctx.scoped("line_draw", || {
            let mut encoder = ctx
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("line_draw_encoder"),
                });
            self.encode_draw(&mut encoder, segments);
            ctx.queue.submit(Some(encoder.finish()));
        })?;

        let bloom_ok = ctx
            .scoped("bloom", || {
                let mut encoder = ctx
                    .device
                    .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                        label: Some("bloom_encoder"),
                    });
                self.targets.bloom.encode(
                    &mut encoder,
                    &self.pipelines.downsample,
                    &self.pipelines.blur,
                );
                #[cfg(test)]
                if self.fault_bloom {
                    // Unaligned clear, rejected by validation.
                    encoder.clear_buffer(&self.fade_uniforms, 1, None);
                }
                ctx.queue.submit(Some(encoder.finish()));
            })
            .is_ok();

        let readback = capture || sinks.iter().any(|sink| sink.needs_readback());
        ctx.scoped("composite", || {
            let mut encoder = ctx
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("composite_encoder"),
                });
            self.encode_composite(&mut encoder);
            for sink in sinks.iter_mut() {
                sink.encode(&ctx.device, &mut encoder, &self.targets.output);
            }
            if readback {
                self.targets
                    .readback
                    .encode_copy(&mut encoder, &self.targets.output);
            }
            ctx.queue.submit(Some(encoder.finish()));
        })?;

        let sequence = frame.sequence;
        self.frames_rendered += 1;

        if !readback {
            return Ok(RenderedFrame {
                sequence,
                captured: None,
                bloom_ok,
            });
        }

        let pixels = self
            .targets
            .readback
            .read_pixels(&ctx.device, RowOrder::TopDown)?;
        let captured = CapturedFrame {
            width: resolution,
            height: resolution,
            row_order: RowOrder::TopDown,
            pixels,
            sequence,
        };
        for sink in sinks.iter_mut().filter(|sink| sink.needs_readback()) {
            sink.deliver(&captured);
        }

        Ok(RenderedFrame {
            sequence,
            captured: capture.then_some(captured),
            bloom_ok,
        })
    }

    /// Apply resolution, bloom and overlay changes before recording any pass.
    fn apply_frame_start(&mut self, params: &RenderParameters) {
        let wanted = self
            .locked_resolution
            .unwrap_or_else(|| clamp_resolution(params.resolution));
        let mut rebind = false;

        if wanted != self.targets.resolution {
            self.targets = Targets::new(
                &self.ctx,
                &self.pipelines,
                wanted,
                &self.config.sanitized_levels(),
            );
            rebind = true;
        }

        if params.overlay != self.overlay_mode {
            log::debug!("Overlay {:?} -> {:?}", self.overlay_mode, params.overlay);
            let image = generate_overlay(params.overlay, OVERLAY_SIZE);
            self.overlay.upload_rgba(&self.ctx.queue, image.as_raw());
            self.overlay_mode = params.overlay;
        }

        if rebind {
            self.fade_bind_group = fade_bind_group(
                &self.ctx.device,
                &self.pipelines,
                &self.targets,
                &self.fade_uniforms,
            );
            self.composite_bind_group = composite_bind_group(
                &self.ctx.device,
                &self.pipelines,
                &self.targets,
                &self.overlay,
                &self.black,
                &self.composite_uniforms,
            );
        }
    }

    fn write_uniforms(&self, params: &RenderParameters, profile: &BeamProfile, resolution: u32) {
        let queue = &self.ctx.queue;

        let fade = FadeUniforms {
            amount: fade_amount(params.persistence_exponent(), params.frame_rate),
            afterglow: params.afterglow_amount(),
            _padding: [0.0; 2],
        };
        queue.write_buffer(&self.fade_uniforms, 0, bytemuck::bytes_of(&fade));

        let [r, g, b] = params.beam_colour();
        let line = LineUniforms {
            resolution: [resolution as f32, resolution as f32],
            size: profile.size_px,
            sigma: profile.sigma_px,
            energy: profile.energy,
            min_length: MIN_SEGMENT_LENGTH,
            _padding: [0.0; 2],
            colour: [r, g, b, 1.0],
        };
        queue.write_buffer(&self.line_uniforms, 0, bytemuck::bytes_of(&line));

        let [sr, sg, sb] = params.screen_colour();
        let composite = CompositeUniforms {
            screen: [sr, sg, sb, params.ambient.max(0.0)],
            bloom_weights: bloom_weights(self.targets.bloom.len()),
            glow: params.glow_amount(),
            exposure: params.exposure.max(0.0),
            overexposure: params.overexposure.max(0.0),
            saturation: params.saturation.clamp(0.0, 1.0),
            noise: params.noise_amount(),
            seed: (self.frames_rendered % 1024) as f32 * 0.618_034,
            _padding: [0.0; 2],
        };
        queue.write_buffer(&self.composite_uniforms, 0, bytemuck::bytes_of(&composite));
    }

    /// Transform points into the vertex buffer, growing it when needed.
    /// Returns the number of segments to draw.
    fn upload_points(&mut self, frame: &BeamFrame, params: &RenderParameters) -> u32 {
        self.vertices.clear();
        if PointTransform::is_identity(params) {
            self.vertices.extend(frame.points.iter().map(LineVertex::from));
        } else {
            let transform = &mut self.transform;
            let rate = frame.point_rate as f64;
            self.vertices.extend(
                frame
                    .points
                    .iter()
                    .map(|&point| LineVertex::from(&transform.apply(point, params, rate))),
            );
        }
        // A lone point is a zero-length segment: a dot.
        if self.vertices.len() == 1 {
            self.vertices.push(self.vertices[0]);
        }
        if self.vertices.len() < 2 {
            return 0;
        }

        if self.vertices.len() > self.vertex_capacity {
            self.vertex_capacity = self.vertices.len().next_power_of_two();
            self.vertex_buffer = vertex_buffer(&self.ctx.device, self.vertex_capacity);
            log::debug!("Vertex buffer grown to {} points", self.vertex_capacity);
        }
        self.ctx
            .queue
            .write_buffer(&self.vertex_buffer, 0, bytemuck::cast_slice(&self.vertices));
        (self.vertices.len() - 1) as u32
    }

    fn encode_draw(&self, encoder: &mut wgpu::CommandEncoder, segments: u32) {
        let accumulation = &self.targets.accumulation;
        encoder.copy_texture_to_texture(
            accumulation.texture().as_image_copy(),
            self.targets.history.texture().as_image_copy(),
            accumulation.extent(),
        );

        let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("fade_and_line_pass"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: self.targets.accumulation.view(),
                resolve_target: None,
                depth_slice: None,
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Load,
                    store: wgpu::StoreOp::Store,
                },
            })],
            depth_stencil_attachment: None,
            timestamp_writes: None,
            occlusion_query_set: None,
            multiview_mask: None,
        });

        pass.set_pipeline(&self.pipelines.fade);
        pass.set_bind_group(0, &self.fade_bind_group, &[]);
        pass.draw(0..3, 0..1);

        if segments > 0 {
            let used = self.vertices.len() as u64 * VERTEX_STRIDE;
            pass.set_pipeline(&self.pipelines.line);
            pass.set_bind_group(0, &self.line_bind_group, &[]);
            pass.set_vertex_buffer(0, self.vertex_buffer.slice(0..used - VERTEX_STRIDE));
            pass.set_vertex_buffer(1, self.vertex_buffer.slice(VERTEX_STRIDE..used));
            pass.draw(0..6, 0..segments);
        }
    }

    fn encode_composite(&self, encoder: &mut wgpu::CommandEncoder) {
        let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("composite_pass"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: self.targets.output.view(),
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
        pass.set_pipeline(&self.pipelines.composite);
        pass.set_bind_group(0, &self.composite_bind_group, &[]);
        pass.draw(0..3, 0..1);
    }
}

fn clamp_resolution(resolution: u32) -> u32 {
    resolution.clamp(MIN_RESOLUTION, MAX_RESOLUTION)
}

fn uniform_buffer<T>(device: &wgpu::Device, label: &str) -> Buffer {
    device.create_buffer(&wgpu::BufferDescriptor {
        label: Some(label),
        size: std::mem::size_of::<T>() as u64,
        usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    })
}

fn vertex_buffer(device: &wgpu::Device, capacity: usize) -> Buffer {
    device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("beam_points"),
        size: capacity as u64 * VERTEX_STRIDE,
        usage: wgpu::BufferUsages::VERTEX | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    })
}

fn uniform_bind_group(
    device: &wgpu::Device,
    layout: &BindGroupLayout,
    buffer: &Buffer,
    label: &str,
) -> BindGroup {
    device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some(label),
        layout,
        entries: &[wgpu::BindGroupEntry {
            binding: 0,
            resource: buffer.as_entire_binding(),
        }],
    })
}

fn fade_bind_group(
    device: &wgpu::Device,
    pipelines: &Pipelines,
    targets: &Targets,
    uniforms: &Buffer,
) -> BindGroup {
    device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some("fade_bind_group"),
        layout: &pipelines.filter_layout,
        entries: &[
            wgpu::BindGroupEntry {
                binding: 0,
                resource: uniforms.as_entire_binding(),
            },
            wgpu::BindGroupEntry {
                binding: 1,
                resource: wgpu::BindingResource::TextureView(targets.history.view()),
            },
            wgpu::BindGroupEntry {
                binding: 2,
                resource: wgpu::BindingResource::Sampler(&pipelines.sampler),
            },
        ],
    })
}

fn composite_bind_group(
    device: &wgpu::Device,
    pipelines: &Pipelines,
    targets: &Targets,
    overlay: &RenderTarget,
    black: &RenderTarget,
    uniforms: &Buffer,
) -> BindGroup {
    let mut bloom_views: Vec<&wgpu::TextureView> =
        targets.bloom.targets().map(RenderTarget::view).collect();
    bloom_views.resize(MAX_BLOOM_LEVELS, black.view());

    let mut entries = vec![
        wgpu::BindGroupEntry {
            binding: 0,
            resource: uniforms.as_entire_binding(),
        },
        wgpu::BindGroupEntry {
            binding: 1,
            resource: wgpu::BindingResource::TextureView(targets.accumulation.view()),
        },
    ];
    for (i, view) in bloom_views.into_iter().enumerate() {
        entries.push(wgpu::BindGroupEntry {
            binding: 2 + i as u32,
            resource: wgpu::BindingResource::TextureView(view),
        });
    }
    entries.push(wgpu::BindGroupEntry {
        binding: 2 + MAX_BLOOM_LEVELS as u32,
        resource: wgpu::BindingResource::TextureView(overlay.view()),
    });
    entries.push(wgpu::BindGroupEntry {
        binding: 3 + MAX_BLOOM_LEVELS as u32,
        resource: wgpu::BindingResource::Sampler(&pipelines.sampler),
    });

    device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some("composite_bind_group"),
        layout: &pipelines.composite_layout,
        entries: &entries,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_vertex_layout() {
        assert_eq!(VERTEX_STRIDE, 32);
        let coloured = BeamPoint {
            colour: Some([0.1, 0.2, 0.3]),
            ..BeamPoint::new(0.5, -0.5)
        };
        let v = LineVertex::from(&coloured);
        assert_eq!(v.position, [0.5, -0.5, 1.0, 0.0]);
        assert_eq!(v.colour, [0.1, 0.2, 0.3, 1.0]);
        assert_eq!(LineVertex::from(&BeamPoint::new(0.0, 0.0)).colour[3], 0.0);
    }

    #[test]
    fn test_uniform_sizes_are_16_byte_aligned() {
        assert_eq!(std::mem::size_of::<FadeUniforms>() % 16, 0);
        assert_eq!(std::mem::size_of::<LineUniforms>(), 48);
        assert_eq!(std::mem::size_of::<CompositeUniforms>(), 64);
    }

    #[tokio::test]
    async fn test_failed_bloom_still_delivers_frame() {
        let Ok(ctx) = GpuContext::new().await else {
            return;
        };
        let params = RenderParameters {
            resolution: 256,
            ..Default::default()
        };
        let mut compositor = Compositor::new(Arc::new(ctx), &params, CompositorConfig::default());
        let frame = BeamFrame {
            points: vec![BeamPoint::new(-0.5, 0.0), BeamPoint::new(0.5, 0.0)],
            point_rate: 192_000.0,
            sequence: 7,
        };
        let mut sinks: Vec<Box<dyn FrameSink>> = Vec::new();

        compositor.fault_bloom = true;
        let rendered = compositor
            .render_frame(&frame, &params, &mut sinks, true)
            .expect("a bloom failure must not skip the frame");
        assert!(!rendered.bloom_ok);
        assert_eq!(rendered.sequence, 7);
        let captured = rendered.captured.expect("capture was requested");
        assert_eq!((captured.width, captured.height), (256, 256));
        assert!(captured.pixels.chunks_exact(4).any(|p| p[..3] != [0, 0, 0]));

        compositor.fault_bloom = false;
        let rendered = compositor
            .render_frame(&frame, &params, &mut sinks, false)
            .unwrap();
        assert!(rendered.bloom_ok);
        assert_eq!(compositor.frames_rendered(), 2);
    }

    #[test]
    fn test_config_falls_back_on_bad_level_count() {
        let config = CompositorConfig {
            bloom_levels: vec![256],
        };
        assert_eq!(config.sanitized_levels(), vec![512, 128]);
        let config = CompositorConfig {
            bloom_levels: vec![512, 256, 128, 64],
        };
        assert_eq!(config.sanitized_levels().len(), 4);
    }
}
