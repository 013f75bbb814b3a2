//! Bind group layout builders for the compositor passes.

use wgpu::{BindGroupLayout, BindGroupLayoutEntry, Device, ShaderStages};

/// Maximum number of bloom levels the composite pass samples.
pub const MAX_BLOOM_LEVELS: usize = 4;

/// Builder for creating bind group layouts with common patterns.
pub struct BindGroupLayoutBuilder {
    label: Option<&'static str>,
    entries: Vec<BindGroupLayoutEntry>,
}

impl BindGroupLayoutBuilder {
    /// Create a new bind group layout builder.
    pub fn new(label: &'static str) -> Self {
        Self {
            label: Some(label),
            entries: Vec::new(),
        }
    }

    /// Add a uniform buffer entry.
    pub fn uniform(mut self, binding: u32, visibility: ShaderStages) -> Self {
        self.entries.push(BindGroupLayoutEntry {
            binding,
            visibility,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Uniform,
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        });
        self
    }

    /// Add a 2D texture entry.
    pub fn texture_2d(mut self, binding: u32, visibility: ShaderStages) -> Self {
        self.entries.push(BindGroupLayoutEntry {
            binding,
            visibility,
            ty: wgpu::BindingType::Texture {
                sample_type: wgpu::TextureSampleType::Float { filterable: true },
                view_dimension: wgpu::TextureViewDimension::D2,
                multisampled: false,
            },
            count: None,
        });
        self
    }

    /// Add a filtering sampler entry.
    pub fn sampler(mut self, binding: u32, visibility: ShaderStages) -> Self {
        self.entries.push(BindGroupLayoutEntry {
            binding,
            visibility,
            ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
            count: None,
        });
        self
    }

    /// Build the bind group layout.
    pub fn build(self, device: &Device) -> BindGroupLayout {
        device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: self.label,
            entries: &self.entries,
        })
    }
}

/// Uniforms only: the line pass.
pub fn create_uniform_layout(device: &Device, label: &'static str) -> BindGroupLayout {
    BindGroupLayoutBuilder::new(label)
        .uniform(0, ShaderStages::VERTEX_FRAGMENT)
        .build(device)
}

/// Single-texture passes: fade, downsample copy and blur
/// (uniforms, source texture, sampler).
pub fn create_filter_layout(device: &Device) -> BindGroupLayout {
    BindGroupLayoutBuilder::new("filter_bind_group_layout")
        .uniform(0, ShaderStages::FRAGMENT)
        .texture_2d(1, ShaderStages::FRAGMENT)
        .sampler(2, ShaderStages::FRAGMENT)
        .build(device)
}

/// Composite pass: uniforms, line texture, every bloom level, overlay,
/// sampler.
pub fn create_composite_layout(device: &Device) -> BindGroupLayout {
    let mut builder = BindGroupLayoutBuilder::new("composite_bind_group_layout")
        .uniform(0, ShaderStages::FRAGMENT)
        .texture_2d(1, ShaderStages::FRAGMENT);
    for level in 0..MAX_BLOOM_LEVELS as u32 {
        builder = builder.texture_2d(2 + level, ShaderStages::FRAGMENT);
    }
    builder
        .texture_2d(2 + MAX_BLOOM_LEVELS as u32, ShaderStages::FRAGMENT)
        .sampler(3 + MAX_BLOOM_LEVELS as u32, ShaderStages::FRAGMENT)
        .build(device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::GpuContext;

    #[tokio::test]
    async fn test_bind_group_layout_builder() {
        let ctx = match GpuContext::new().await {
            Ok(ctx) => ctx,
            Err(_) => return, // Skip if no GPU
        };

        let layout = BindGroupLayoutBuilder::new("test_layout")
            .uniform(0, ShaderStages::VERTEX)
            .texture_2d(1, ShaderStages::FRAGMENT)
            .sampler(2, ShaderStages::FRAGMENT)
            .build(&ctx.device);

        drop(layout);
    }

    #[tokio::test]
    async fn test_compositor_layouts_creation() {
        let ctx = match GpuContext::new().await {
            Ok(ctx) => ctx,
            Err(_) => return,
        };

        let _uniforms = create_uniform_layout(&ctx.device, "fade_layout");
        let _filter = create_filter_layout(&ctx.device);
        let _composite = create_composite_layout(&ctx.device);
    }
}
