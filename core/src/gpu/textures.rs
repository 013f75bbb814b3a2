//! Frame targets and host readback.

use wgpu::{Device, Texture, TextureFormat, TextureUsages, TextureView};

use super::context::GpuError;

/// Format of the accumulation and bloom targets. Float so faint trails
/// survive many fade passes without banding to zero.
pub const ACCUMULATION_FORMAT: TextureFormat = TextureFormat::Rgba16Float;
/// Format of the composited output, matching the encoder's rgba input.
pub const OUTPUT_FORMAT: TextureFormat = TextureFormat::Rgba8Unorm;

/// A render target that owns both texture and view.
/// The texture must outlive its view, so we keep them together.
pub struct RenderTarget {
    texture: Texture,
    view: TextureView,
    width: u32,
    height: u32,
}

impl RenderTarget {
    /// Create a new render target with the specified usage flags.
    pub fn new(
        device: &Device,
        label: &str,
        width: u32,
        height: u32,
        format: TextureFormat,
        usage: TextureUsages,
    ) -> Self {
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some(label),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format,
            usage,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        Self {
            texture,
            view,
            width,
            height,
        }
    }

    /// Intermediate target that is drawn into and sampled by later passes,
    /// and copied between scene targets.
    pub fn for_scene(device: &Device, label: &str, width: u32, height: u32) -> Self {
        Self::new(
            device,
            label,
            width,
            height,
            ACCUMULATION_FORMAT,
            TextureUsages::RENDER_ATTACHMENT
                | TextureUsages::TEXTURE_BINDING
                | TextureUsages::COPY_SRC
                | TextureUsages::COPY_DST,
        )
    }

    /// Final composite: copyable to host memory and to other textures.
    pub fn for_output(device: &Device, label: &str, width: u32, height: u32) -> Self {
        Self::new(
            device,
            label,
            width,
            height,
            OUTPUT_FORMAT,
            TextureUsages::RENDER_ATTACHMENT
                | TextureUsages::COPY_SRC
                | TextureUsages::TEXTURE_BINDING,
        )
    }

    /// Static texture filled from host memory (overlays, placeholders).
    pub fn for_upload(device: &Device, label: &str, width: u32, height: u32) -> Self {
        Self::new(
            device,
            label,
            width,
            height,
            OUTPUT_FORMAT,
            TextureUsages::TEXTURE_BINDING | TextureUsages::COPY_DST,
        )
    }

    /// Replace the whole texture with tightly packed RGBA8 pixels.
    pub fn upload_rgba(&self, queue: &wgpu::Queue, pixels: &[u8]) {
        queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &self.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            pixels,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(self.width * 4),
                rows_per_image: Some(self.height),
            },
            self.extent(),
        );
    }

    /// Get the texture view for rendering or sampling.
    pub fn view(&self) -> &TextureView {
        &self.view
    }

    /// Get the underlying texture (for copy operations).
    pub fn texture(&self) -> &Texture {
        &self.texture
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn extent(&self) -> wgpu::Extent3d {
        wgpu::Extent3d {
            width: self.width,
            height: self.height,
            depth_or_array_layers: 1,
        }
    }
}

/// Vertical order of rows in a captured frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub enum RowOrder {
    /// First row is the top of the image.
    #[default]
    TopDown,
    /// First row is the bottom of the image.
    BottomUp,
}

/// A composited frame copied to host memory: tightly packed RGBA8.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    pub width: u32,
    pub height: u32,
    pub row_order: RowOrder,
    pub pixels: Vec<u8>,
    pub sequence: u64,
}

impl CapturedFrame {
    /// Byte length of a frame with the given dimensions.
    pub fn byte_len(width: u32, height: u32) -> usize {
        width as usize * height as usize * 4
    }

    /// Reorder rows in place if `order` differs from the current order.
    pub fn into_row_order(mut self, order: RowOrder) -> Self {
        if self.row_order != order {
            let row = self.width as usize * 4;
            let height = self.height as usize;
            for i in 0..height / 2 {
                let (top, bottom) = self.pixels.split_at_mut((height - 1 - i) * row);
                top[i * row..(i + 1) * row].swap_with_slice(&mut bottom[..row]);
            }
            self.row_order = order;
        }
        self
    }

    /// Top-down image view of the frame.
    pub fn to_image(&self) -> Option<image::RgbaImage> {
        let top_down = self.clone().into_row_order(RowOrder::TopDown);
        image::RgbaImage::from_raw(self.width, self.height, top_down.pixels)
    }

    /// RGBA of one pixel, addressed from the top-left corner.
    pub fn pixel(&self, x: u32, y: u32) -> [u8; 4] {
        let row = match self.row_order {
            RowOrder::TopDown => y,
            RowOrder::BottomUp => self.height - 1 - y,
        };
        let i = (row as usize * self.width as usize + x as usize) * 4;
        [
            self.pixels[i],
            self.pixels[i + 1],
            self.pixels[i + 2],
            self.pixels[i + 3],
        ]
    }
}

/// Readback buffer for copying GPU texture data to CPU.
pub struct ReadbackBuffer {
    buffer: wgpu::Buffer,
    width: u32,
    height: u32,
    padded_row_bytes: u32,
    unpadded_row_bytes: u32,
}

impl ReadbackBuffer {
    /// Create a new readback buffer sized for the given dimensions.
    pub fn new(device: &Device, width: u32, height: u32) -> Self {
        let bytes_per_pixel = 4u32;
        let unpadded_row_bytes = width * bytes_per_pixel;
        let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
        let padded_row_bytes = unpadded_row_bytes.div_ceil(align) * align;

        let buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("readback_buffer"),
            size: (padded_row_bytes * height) as u64,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        Self {
            buffer,
            width,
            height,
            padded_row_bytes,
            unpadded_row_bytes,
        }
    }

    /// Get the padded bytes per row (for texture copy).
    pub fn padded_row_bytes(&self) -> u32 {
        self.padded_row_bytes
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Record a copy of `source` into this buffer.
    pub fn encode_copy(&self, encoder: &mut wgpu::CommandEncoder, source: &RenderTarget) {
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture: source.texture(),
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &self.buffer,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(self.padded_row_bytes),
                    rows_per_image: Some(self.height),
                },
            },
            source.extent(),
        );
    }

    /// Map the buffer and copy pixels out, removing row padding and writing
    /// rows in the requested order. The buffer is unmapped before returning.
    pub fn read_pixels(&self, device: &Device, order: RowOrder) -> Result<Vec<u8>, GpuError> {
        let buffer_slice = self.buffer.slice(..);
        let (sender, receiver) = std::sync::mpsc::channel();
        buffer_slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        device.poll(wgpu::PollType::wait_indefinitely())?;
        receiver.recv().map_err(|_| GpuError::ReadbackLost)??;

        let mut pixels = Vec::with_capacity((self.width * self.height * 4) as usize);
        {
            let data = buffer_slice.get_mapped_range();
            // The GPU stores row 0 at the top of the image.
            for i in 0..self.height {
                let row = match order {
                    RowOrder::TopDown => i,
                    RowOrder::BottomUp => self.height - 1 - i,
                };
                let start = (row * self.padded_row_bytes) as usize;
                let end = start + self.unpadded_row_bytes as usize;
                pixels.extend_from_slice(&data[start..end]);
            }
        }
        self.buffer.unmap();
        Ok(pixels)
    }
}
