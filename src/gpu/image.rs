// gpu/image.rs — 8-bit images resident on the GPU.
//
// RESPONSIBILITIES
// ─────────────────
// 1. `GpuImage` — one single-channel picture stored as an R32Uint texture:
//    sampled (`texture_2d<u32>`) when a kernel reads it, bound as a
//    write-only storage texture when downsample writes it.
//
// 2. Upload — widen tightly-packed `u8` rows to `u32` texels in a staging
//    buffer and record a buffer→texture copy into the caller's encoder, so
//    the upload is ordered with the kernels around it.
//
// 3. Readback — copy texture→buffer, map, narrow back to `u8`.
//
//
// WHY R32UINT AND NOT R8UINT?
// ───────────────────────────
// Write-only storage access for 8-bit formats is not part of core WebGPU;
// R32Uint is. Every kernel works on integer pixel values, so widening
// costs bandwidth but no precision.
//
//
// ROW ALIGNMENT
// ─────────────
// `bytes_per_row` of a buffer↔texture copy must be a multiple of
// `wgpu::COPY_BYTES_PER_ROW_ALIGNMENT` (256). Staging rows are padded:
//
//   staging (width = 3):  [p0 p1 p2 | pad … ] [p3 p4 p5 | pad … ] …
//                          ^ 4 bytes each     ^ row starts every 256 bytes
//
//
// NEW RUST CONCEPTS
// ──────────────────
// - `wgpu::util::DeviceExt::create_buffer_init` — buffer created with its
//   contents in one call, used for the staging copy.
// - `chunks_exact` — iterate packed rows without index arithmetic.

use wgpu::util::DeviceExt;

use crate::error::BackendError;

/// Bytes per texel of the R32Uint storage format.
const TEXEL_BYTES: u32 = 4;

/// Round `value` up to the next multiple of `alignment`.
#[inline]
pub(crate) fn align_to(value: u32, alignment: u32) -> u32 {
    value.div_ceil(alignment) * alignment
}

/// Staging row pitch for a `width`-texel R32Uint row.
pub(crate) fn padded_row_bytes(width: u32) -> u32 {
    align_to(width * TEXEL_BYTES, wgpu::COPY_BYTES_PER_ROW_ALIGNMENT)
}

/// Widen packed `u8` rows into padded little-endian `u32` staging rows.
pub(crate) fn widen_rows(pixels: &[u8], width: u32, height: u32) -> Vec<u8> {
    let pitch = padded_row_bytes(width) as usize;
    let mut staging = vec![0u8; pitch * height as usize];
    if width == 0 {
        return staging;
    }
    for (row, dst) in pixels.chunks_exact(width as usize).zip(staging.chunks_exact_mut(pitch)) {
        for (&p, texel) in row.iter().zip(dst.chunks_exact_mut(TEXEL_BYTES as usize)) {
            texel.copy_from_slice(&(p as u32).to_le_bytes());
        }
    }
    staging
}

/// Narrow padded `u32` staging rows back to packed `u8` rows. Texels above
/// 255 saturate.
pub(crate) fn narrow_rows(staging: &[u8], width: u32, height: u32) -> Vec<u8> {
    let pitch = padded_row_bytes(width) as usize;
    let mut out = Vec::with_capacity((width * height) as usize);
    for row in staging.chunks_exact(pitch).take(height as usize) {
        for texel in row[..(width * TEXEL_BYTES) as usize].chunks_exact(TEXEL_BYTES as usize) {
            let v = u32::from_le_bytes([texel[0], texel[1], texel[2], texel[3]]);
            out.push(v.min(255) as u8);
        }
    }
    out
}

/// A single-channel picture on the GPU.
pub struct GpuImage {
    pub texture: wgpu::Texture,
    /// Used for both sampled and storage bindings.
    pub view: wgpu::TextureView,
    pub width: u32,
    pub height: u32,
}

impl GpuImage {
    /// Allocate a zero-filled `width × height` image.
    pub fn new(device: &wgpu::Device, width: u32, height: u32) -> Self {
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("GpuImage"),
            size: wgpu::Extent3d {
                width: width.max(1),
                height: height.max(1),
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::R32Uint,
            usage: wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::STORAGE_BINDING
                | wgpu::TextureUsages::COPY_DST
                | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        GpuImage { texture, view, width, height }
    }

    fn extent(&self) -> wgpu::Extent3d {
        wgpu::Extent3d { width: self.width, height: self.height, depth_or_array_layers: 1 }
    }

    /// Record an upload of packed `width * height` pixels into `encoder`.
    pub fn record_upload(
        &self,
        device: &wgpu::Device,
        encoder: &mut wgpu::CommandEncoder,
        pixels: &[u8],
    ) -> Result<(), BackendError> {
        let expected = (self.width * self.height) as usize;
        if pixels.len() != expected {
            return Err(BackendError::SizeMismatch { expected, actual: pixels.len() });
        }
        if expected == 0 {
            return Ok(());
        }
        let staging = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("GpuImage::staging"),
            contents: &widen_rows(pixels, self.width, self.height),
            usage: wgpu::BufferUsages::COPY_SRC,
        });
        encoder.copy_buffer_to_texture(
            wgpu::ImageCopyBuffer {
                buffer: &staging,
                layout: wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(padded_row_bytes(self.width)),
                    rows_per_image: Some(self.height),
                },
            },
            self.texture.as_image_copy(),
            self.extent(),
        );
        Ok(())
    }

    /// Record a copy of the whole image into a new mappable buffer.
    pub fn record_readback(&self, device: &wgpu::Device, encoder: &mut wgpu::CommandEncoder) -> wgpu::Buffer {
        let size = (padded_row_bytes(self.width) * self.height.max(1)) as u64;
        let buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("GpuImage::readback"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        if self.width > 0 && self.height > 0 {
            encoder.copy_texture_to_buffer(
                self.texture.as_image_copy(),
                wgpu::ImageCopyBuffer {
                    buffer: &buffer,
                    layout: wgpu::ImageDataLayout {
                        offset: 0,
                        bytes_per_row: Some(padded_row_bytes(self.width)),
                        rows_per_image: Some(self.height),
                    },
                },
                self.extent(),
            );
        }
        buffer
    }
}
