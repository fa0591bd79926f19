// pyramid.rs — resolution pyramid construction.
//
// Every frame, the freshly uploaded full-resolution image is reduced to
// 2×, 4× and 8× copies by ONE `downsample` dispatch. All three levels are
// computed directly from full resolution (not 8× from 4× from 2×), so the
// levels are coupled only through the predictor cascade, never through
// pixels:
//
//   full ──┬──► 2×   (units(w,2) × units(h,2))
//          ├──► 4×   (units(w,4) × units(h,4))
//          └──► 8×   (units(w,8) × units(h,8))
//
// Each output pixel is the rounded mean of the f×f full-resolution pixels
// it covers, with border replication past the picture edge:
//
//   out(x, y) = (Σ src(clamp(f·x+i), clamp(f·y+j)) + f²/2) / f²
//
// DISPATCH SHAPE
// ──────────────
// Global `(align16(units(w,4)), units(h,16))`, local `(16, 1)`. A work item
// owns a 4×16 strip of full-resolution pixels, so the extent counts strips,
// not pixels. The same extent drives both backends.
//
// INTERLACED
// ──────────
// In native field mode the source is the whole frame and `polarity` picks
// the lines: field line y reads frame line 2·clamp(y) + polarity. Split mode
// uploads a half-height field image and needs no mapping.
//
// NEW RUST CONCEPTS
// ──────────────────
// - Pure "describe" function + thin "enqueue" wrapper: `dispatch()` builds a
//   plain `Dispatch` value that tests can inspect without any device, and
//   `build()` is the only place that touches the backend.

use tracing::trace;

use crate::align::{align16, units, SIMD_SIZE};
use crate::backend::{ComputeBackend, Dispatch, ImageHandle, Kernel, KernelArg, KernelParams};
use crate::buffers::TierImages;
use crate::error::BackendError;
use crate::frame::Polarity;
use crate::image::Image;

/// Builds the 2×/4×/8× levels for one picture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolutionPyramidBuilder {
    width: u32,
    /// Picture height: the field height in interlaced modes.
    height: u32,
    /// Native field mode: the source holds both fields.
    field: Option<Polarity>,
}

impl ResolutionPyramidBuilder {
    /// Progressive picture (or a host-extracted field).
    pub fn new(width: u32, height: u32) -> Self {
        ResolutionPyramidBuilder { width, height, field: None }
    }

    /// One field of a full-height interlaced frame, read in place.
    pub fn native_field(width: u32, field_height: u32, polarity: Polarity) -> Self {
        ResolutionPyramidBuilder { width, height: field_height, field: Some(polarity) }
    }

    pub fn global_extent(&self) -> [u32; 2] {
        [align16(units(self.width, 4)), units(self.height, 16)]
    }

    /// Describe the dispatch writing `levels`' current images from `src`.
    pub fn dispatch(&self, src: ImageHandle, levels: &TierImages) -> Dispatch {
        let [d2, d4, d8] = levels.currents();
        Dispatch {
            kernel: Kernel::Downsample,
            global: self.global_extent(),
            local: [SIMD_SIZE, 1],
            args: vec![
                KernelArg::Image(src),
                KernelArg::Image(d2),
                KernelArg::Image(d4),
                KernelArg::Image(d8),
            ],
            params: KernelParams {
                width: self.width,
                height: self.height,
                interlaced: self.field.is_some() as u32,
                polarity: self.field.map_or(0, Polarity::index),
                ..KernelParams::default()
            },
        }
    }

    /// Queue the downsample and mark the levels as holding this frame.
    pub fn build<B: ComputeBackend>(
        &self,
        backend: &mut B,
        src: ImageHandle,
        levels: &mut TierImages,
    ) -> Result<(), BackendError> {
        let d = self.dispatch(src, levels);
        trace!(global = ?d.global, field = ?self.field, "pyramid");
        backend.enqueue_kernel(&d)?;
        levels.mark_written();
        Ok(())
    }
}

/// Straightforward per-pixel box reduction of `src` by `factor`. The
/// dispatched kernel must agree with this exactly.
pub fn box_downsample(src: &Image<u8>, factor: u32) -> Image<u8> {
    let (w, h) = (src.width() as u32, src.height() as u32);
    let (ow, oh) = (units(w, factor), units(h, factor));
    let area = factor * factor;
    let mut out = Image::new(ow as usize, oh as usize);
    for oy in 0..oh {
        for ox in 0..ow {
            let mut sum = 0u32;
            for j in 0..factor {
                for i in 0..factor {
                    sum += src.get_clamped((ox * factor + i) as i32, (oy * factor + j) as i32) as u32;
                }
            }
            out.set(ox as usize, oy as usize, ((sum + area / 2) / area) as u8);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffers::FrameBufferPair;

    #[test]
    fn test_global_extent() {
        let b = ResolutionPyramidBuilder::new(1280, 720);
        assert_eq!(b.global_extent(), [320, 45]);
        let b = ResolutionPyramidBuilder::new(176, 144);
        assert_eq!(b.global_extent(), [48, 9]);
        let b = ResolutionPyramidBuilder::new(100, 17);
        assert_eq!(b.global_extent(), [32, 2]);
    }

    #[test]
    fn test_dispatch_is_valid_and_targets_currents() {
        let mut cpu = crate::cpu::CpuBackend::new();
        let levels = TierImages::new(&mut cpu, 64, 64).unwrap();
        let src = FrameBufferPair::new(&mut cpu, 64, 64).unwrap();
        let d = ResolutionPyramidBuilder::new(64, 64).dispatch(src.current(), &levels);
        assert!(d.validate().is_ok());
        assert_eq!(d.args[1], KernelArg::Image(levels.currents()[0]));
        assert_eq!(d.params.interlaced, 0);
    }

    #[test]
    fn test_native_field_params() {
        let b = ResolutionPyramidBuilder::native_field(64, 32, Polarity::Bottom);
        let mut cpu = crate::cpu::CpuBackend::new();
        let levels = TierImages::new(&mut cpu, 64, 32).unwrap();
        let d = b.dispatch(ImageHandle(99), &levels);
        assert_eq!(d.params.interlaced, 1);
        assert_eq!(d.params.polarity, 1);
        assert_eq!(d.params.height, 32);
        assert_eq!(d.global, [16, 2]);
    }

    #[test]
    fn test_box_downsample_rounds() {
        let src = Image::from_vec(2, 2, vec![0u8, 1, 1, 1]);
        // (3 + 2) / 4 = 1
        assert_eq!(box_downsample(&src, 2).get(0, 0), 1);
        let src = Image::from_vec(2, 2, vec![0u8, 0, 1, 1]);
        // (2 + 2) / 4 = 1, rounds half up
        assert_eq!(box_downsample(&src, 2).get(0, 0), 1);
    }
}
