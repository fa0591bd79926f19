// refine.rs — full-resolution refinement dispatch (plain, WPP, field).
//
// The last stage of every frame: one `refine` (or `refine_wpp`) launch over
// the full-resolution current/reference pair, seeded by the 2× predictor
// buffer. It produces a vector per 4×4 sub-block, a residual per 4×4
// sub-block and a partition shape per macroblock.
//
// VARIANTS
// ────────
//   Plain   global (align16(w), 1), local (16, 1): work group = macroblock
//           column, rows walked in order inside the kernel
//           (`iterations = mb_height`). The row-above dependency is met by
//           program order.
//
//   WPP     global (T·16, 1), T = min(mb_width, compute_units·factor).
//           Work group t owns rows t, t+T, …; the scoreboard gates each
//           macroblock on its top-right neighbour:
//
//             row 0  ■ ■ ■ ■ ■ ■ ■ ■
//             row 1    ■ ■ ■ ■ ■ ■ ■ ■      each row trails the one
//             row 2      ■ ■ ■ ■ ■ ■ ■ ■    above by ≥ 1 macroblock
//
//           The scoreboard is zeroed (queued) before every launch.
//
// Both variants see exactly the same candidates per macroblock, so their
// outputs are bit-identical.
//
// FIELDS
// ──────
// The grid is built from the field height. Native layout binds the
// full-height frame and sets `interlaced = 1` so the kernel reads every
// other line starting at `polarity`. Split layout binds host-extracted
// half-height images; the kernel reads them progressively.

use tracing::trace;

use crate::align::{align16, SIMD_SIZE};
use crate::backend::{
    BufferHandle, ComputeBackend, Dispatch, ImageHandle, Kernel, KernelArg, KernelParams, SEARCH_RANGE,
};
use crate::buffers::ResultBuffers;
use crate::config::MeParams;
use crate::error::BackendError;
use crate::frame::Polarity;
use crate::mv::{MacroblockGrid, Tier};
use crate::scoreboard::{wpp_threads, WppScoreboard};

/// How the picture being estimated sits in the bound images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PictureLayout {
    #[default]
    Progressive,
    /// One field, read in place from a full-height frame.
    NativeField(Polarity),
    /// One field, extracted on the host into its own half-height image.
    SplitField(Polarity),
}

impl PictureLayout {
    pub fn polarity(self) -> Option<Polarity> {
        match self {
            PictureLayout::Progressive => None,
            PictureLayout::NativeField(p) | PictureLayout::SplitField(p) => Some(p),
        }
    }

    /// True when the bound images hold both fields.
    pub fn is_native(self) -> bool {
        matches!(self, PictureLayout::NativeField(_))
    }
}

/// Row scheduling of the refinement launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefineMode {
    Plain,
    Wpp { threads: u32 },
}

/// Describes and issues the refinement launch for one picture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefinementStage {
    grid: MacroblockGrid,
    params: MeParams,
    layout: PictureLayout,
    mode: RefineMode,
}

impl RefinementStage {
    /// Column-per-group refinement of a `width × height` picture (field
    /// dimensions for interlaced layouts).
    pub fn plain(width: u32, height: u32, params: MeParams) -> Self {
        RefinementStage {
            grid: MacroblockGrid::new(width, height),
            params,
            layout: PictureLayout::Progressive,
            mode: RefineMode::Plain,
        }
    }

    /// Wavefront refinement sized from the device's compute units.
    pub fn wpp(width: u32, height: u32, params: MeParams, compute_units: u32, thread_factor: u32) -> Self {
        let grid = MacroblockGrid::new(width, height);
        let threads = wpp_threads(grid.mb_width, compute_units, thread_factor);
        RefinementStage {
            grid,
            params,
            layout: PictureLayout::Progressive,
            mode: RefineMode::Wpp { threads },
        }
    }

    pub fn with_layout(mut self, layout: PictureLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn grid(&self) -> MacroblockGrid {
        self.grid
    }

    pub fn mode(&self) -> RefineMode {
        self.mode
    }

    pub fn layout(&self) -> PictureLayout {
        self.layout
    }

    pub fn global_extent(&self) -> [u32; 2] {
        match self.mode {
            RefineMode::Plain => [align16(self.grid.width), 1],
            RefineMode::Wpp { threads } => [threads * SIMD_SIZE, 1],
        }
    }

    fn kernel_params(&self) -> KernelParams {
        KernelParams {
            width: self.grid.width,
            height: self.grid.height,
            factor: 1,
            pred_mb_width: self.grid.at_tier(Tier::Half).mb_width,
            lambda: self.params.lambda(),
            sad_adjust: self.params.sad_adjust.code(),
            subpel: self.params.subpel.code(),
            interlaced: self.layout.is_native() as u32,
            polarity: self.layout.polarity().map_or(0, Polarity::index),
            iterations: self.grid.mb_height,
            threads: match self.mode {
                RefineMode::Plain => 0,
                RefineMode::Wpp { threads } => threads,
            },
            search_range: SEARCH_RANGE,
            mb_width: self.grid.mb_width,
            mb_height: self.grid.mb_height,
            ..KernelParams::default()
        }
    }

    /// Describe the launch. WPP requires a scoreboard matching the grid.
    pub fn dispatch(
        &self,
        src: ImageHandle,
        refr: ImageHandle,
        pred_2x: BufferHandle,
        out: &ResultBuffers,
        scoreboard: Option<&WppScoreboard>,
    ) -> Result<Dispatch, BackendError> {
        let mut args = vec![
            KernelArg::Image(src),
            KernelArg::Image(refr),
            KernelArg::Buffer(pred_2x),
            KernelArg::Buffer(out.mvs),
            KernelArg::Buffer(out.residuals),
            KernelArg::Buffer(out.shapes),
        ];
        let kernel = match self.mode {
            RefineMode::Plain => Kernel::Refine,
            RefineMode::Wpp { .. } => {
                let sb = scoreboard.ok_or_else(|| BackendError::InvalidArgument {
                    kernel: Kernel::RefineWpp.name(),
                    reason: "WPP refinement needs a scoreboard".into(),
                })?;
                if sb.mb_width() != self.grid.mb_width {
                    return Err(BackendError::InvalidArgument {
                        kernel: Kernel::RefineWpp.name(),
                        reason: format!(
                            "scoreboard holds {} columns, grid has {}",
                            sb.mb_width(),
                            self.grid.mb_width
                        ),
                    });
                }
                args.push(KernelArg::Buffer(sb.buffer()));
                Kernel::RefineWpp
            }
        };
        Ok(Dispatch {
            kernel,
            global: self.global_extent(),
            local: [SIMD_SIZE, 1],
            args,
            params: self.kernel_params(),
        })
    }

    /// Queue the launch (and, for WPP, the scoreboard reset before it).
    pub fn run<B: ComputeBackend>(
        &self,
        backend: &mut B,
        src: ImageHandle,
        refr: ImageHandle,
        pred_2x: BufferHandle,
        out: &ResultBuffers,
        scoreboard: Option<&WppScoreboard>,
    ) -> Result<(), BackendError> {
        let d = self.dispatch(src, refr, pred_2x, out, scoreboard)?;
        if let (RefineMode::Wpp { .. }, Some(sb)) = (self.mode, scoreboard) {
            sb.reset(backend)?;
        }
        trace!(kernel = %d.kernel, global = ?d.global, layout = ?self.layout, "refine");
        backend.enqueue_kernel(&d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::CpuBackend;

    #[test]
    fn test_plain_extent_is_one_group_per_column() {
        let s = RefinementStage::plain(1280, 720, MeParams::default());
        assert_eq!(s.global_extent(), [1280, 1]);
        assert_eq!(s.kernel_params().iterations, 45);
        let s = RefinementStage::plain(100, 40, MeParams::default());
        assert_eq!(s.global_extent(), [112, 1]);
    }

    #[test]
    fn test_wpp_extent_capped_by_compute_units() {
        let s = RefinementStage::wpp(1280, 720, MeParams::default(), 2, 7);
        assert_eq!(s.mode(), RefineMode::Wpp { threads: 14 });
        assert_eq!(s.global_extent(), [14 * 16, 1]);
        let s = RefinementStage::wpp(64, 64, MeParams::default(), 8, 7);
        assert_eq!(s.mode(), RefineMode::Wpp { threads: 4 });
    }

    #[test]
    fn test_params_forwarded_verbatim() {
        let params = MeParams {
            qp: 40,
            sad_adjust: crate::config::SadAdjust::Haar,
            subpel: crate::config::SubpelMode::Half,
        };
        let p = RefinementStage::plain(176, 144, params).kernel_params();
        assert_eq!(p.sad_adjust, 2);
        assert_eq!(p.subpel, 1);
        assert_eq!(p.lambda, params.lambda());
        // 2× grid of 176 is 88 pixels → 6 macroblocks.
        assert_eq!(p.pred_mb_width, 6);
    }

    #[test]
    fn test_layout_flags() {
        let base = RefinementStage::plain(64, 32, MeParams::default());
        let native = base.with_layout(PictureLayout::NativeField(Polarity::Bottom)).kernel_params();
        assert_eq!((native.interlaced, native.polarity, native.height), (1, 1, 32));
        let split = base.with_layout(PictureLayout::SplitField(Polarity::Bottom)).kernel_params();
        assert_eq!((split.interlaced, split.polarity), (0, 1));
    }

    #[test]
    fn test_wpp_needs_matching_scoreboard() {
        let mut cpu = CpuBackend::new();
        let s = RefinementStage::wpp(64, 64, MeParams::default(), 1, 7);
        let out = ResultBuffers::new(&mut cpu, s.grid()).unwrap();
        let pred = cpu.create_buffer(4096).unwrap();
        let (a, b) = (cpu.create_image(64, 64).unwrap(), cpu.create_image(64, 64).unwrap());
        assert!(s.dispatch(a, b, pred, &out, None).is_err());
        let wrong = WppScoreboard::new(&mut cpu, 3).unwrap();
        assert!(s.dispatch(a, b, pred, &out, Some(&wrong)).is_err());
        let sb = WppScoreboard::new(&mut cpu, 4).unwrap();
        let d = s.dispatch(a, b, pred, &out, Some(&sb)).unwrap();
        assert_eq!(d.kernel, Kernel::RefineWpp);
        assert!(d.validate().is_ok());
    }

    #[test]
    fn test_wpp_run_completes_scoreboard() {
        let mut cpu = CpuBackend::with_compute_units(1);
        cpu.build_kernels().unwrap();
        let s = RefinementStage::wpp(48, 32, MeParams::default(), 1, 2);
        let out = ResultBuffers::new(&mut cpu, s.grid()).unwrap();
        let pred = cpu.create_buffer(4096).unwrap();
        let (a, b) = (cpu.create_image(48, 32).unwrap(), cpu.create_image(48, 32).unwrap());
        let sb = WppScoreboard::new(&mut cpu, 3).unwrap();
        cpu.write_buffer(sb.buffer(), &[9, 9, 9]).unwrap();
        s.run(&mut cpu, a, b, pred, &out, Some(&sb)).unwrap();
        cpu.finish().unwrap();
        // Reset to zero, then every column finished both rows.
        assert_eq!(sb.snapshot(&mut cpu).unwrap(), vec![2, 2, 2]);
    }
}
