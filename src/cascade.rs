// cascade.rs — coarse-to-fine predictor cascade.
//
// Three `hme_tier` dispatches, coarsest first. Each tier searches its own
// downsampled current/reference pair and writes one hint per 8×8 quadrant
// of every tier macroblock; the next finer tier reads those hints (doubled)
// as search centres:
//
//   8×  ──pred_8x──►  4×  ──pred_4x──►  2×  ──pred_2x──►  refine (full res)
//   (null input)
//
// A quadrant at tier f is exactly one macroblock at tier f/2, which is why
// MV_PER_DIM is 4 and why each predictor buffer is sized from the grid of
// the tier that PRODUCES it.
//
// Global extent per tier: `(align16(units(w,f)), units(units(h,f),16))`,
// local `(16,1)`, i.e. one 16-lane group per tier macroblock.

use tracing::trace;

use crate::align::{align16, units, SIMD_SIZE};
use crate::backend::{ComputeBackend, Dispatch, Kernel, KernelArg, KernelParams, SEARCH_RANGE};
use crate::buffers::{PredictorBuffers, TierImages};
use crate::config::MeParams;
use crate::error::BackendError;
use crate::mv::{MacroblockGrid, Tier};

/// Issues the three tier searches for one picture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PredictorCascade {
    grid: MacroblockGrid,
    lambda: u32,
    search_range: u32,
}

impl PredictorCascade {
    /// `width × height` is the picture being estimated (a field in
    /// interlaced modes).
    pub fn new(width: u32, height: u32, params: &MeParams) -> Self {
        PredictorCascade {
            grid: MacroblockGrid::new(width, height),
            lambda: params.lambda(),
            search_range: SEARCH_RANGE,
        }
    }

    pub fn grid(&self) -> MacroblockGrid {
        self.grid
    }

    pub fn global_extent(&self, tier: Tier) -> [u32; 2] {
        let f = tier.factor();
        [align16(units(self.grid.width, f)), units(units(self.grid.height, f), 16)]
    }

    /// The dispatch for one coarse tier.
    pub fn tier_dispatch(&self, tier: Tier, levels: &TierImages, preds: &PredictorBuffers) -> Dispatch {
        let pair = levels.pair(tier);
        let tier_grid = self.grid.at_tier(tier);
        let (pred_in, pred_mb_width) = match tier.coarser() {
            Some(c) => (KernelArg::Buffer(preds.get(c)), self.grid.at_tier(c).mb_width),
            None => (KernelArg::Null, 0),
        };
        Dispatch {
            kernel: Kernel::HmeTier,
            global: self.global_extent(tier),
            local: [SIMD_SIZE, 1],
            args: vec![
                KernelArg::Image(pair.current()),
                KernelArg::Image(pair.reference()),
                pred_in,
                KernelArg::Buffer(preds.get(tier)),
            ],
            params: KernelParams {
                width: tier_grid.width,
                height: tier_grid.height,
                factor: tier.factor(),
                pred_mb_width,
                lambda: self.lambda,
                search_range: self.search_range,
                mb_width: tier_grid.mb_width,
                mb_height: tier_grid.mb_height,
                ..KernelParams::default()
            },
        }
    }

    /// All three dispatches in issue order.
    pub fn dispatches(&self, levels: &TierImages, preds: &PredictorBuffers) -> Vec<Dispatch> {
        Tier::CASCADE
            .iter()
            .map(|&t| self.tier_dispatch(t, levels, preds))
            .collect()
    }

    /// Queue 8× → 4× → 2×. The 2× predictor buffer is ready for refinement
    /// once the queue reaches it.
    pub fn run<B: ComputeBackend>(
        &self,
        backend: &mut B,
        levels: &TierImages,
        preds: &PredictorBuffers,
    ) -> Result<(), BackendError> {
        for d in self.dispatches(levels, preds) {
            trace!(factor = d.params.factor, global = ?d.global, "cascade tier");
            backend.enqueue_kernel(&d)?;
        }
        Ok(())
    }
}
