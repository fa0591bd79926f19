// buffers.rs — device-resident buffers that persist across frames.
//
// PING-PONG
// ─────────
// Motion estimation compares this frame against the previous one, so every
// pyramid level keeps two images. `FrameBufferPair` is a two-slot ring:
//
//            swap()                     swap()
//   cur → [A] ref → [B]   ⇒   cur → [B] ref → [A]   ⇒   cur → [A] ref → [B]
//
// The swap exchanges handles only. After `swap()`, last frame's "current"
// is this frame's "reference" without a single pixel moving, and the new
// "current" slot is free to be overwritten by the upload.
//
// The pair also tracks whether its reference slot holds real pixels
// (`primed`). It becomes true on the first swap after a write; frame 0 never
// runs refinement, so an unprimed reference is never read.
//
// The remaining types bundle the per-picture buffers the stages share: the
// three coarse pairs, the predictor buffer of each tier and the refinement
// outputs.

use tracing::trace;

use crate::align::units;
use crate::backend::{BufferHandle, ComputeBackend, ImageHandle};
use crate::error::BackendError;
use crate::mv::{
    predictor_bytes, predictor_count, FrameResults, MacroblockGrid, MotionVectorField,
    ResidualField, ShapeField, Tier, SUBBLOCKS_PER_MB,
};

// ---------------------------------------------------------------------------
// FrameBufferPair
// ---------------------------------------------------------------------------

/// Two equally-sized images with an O(1) current/reference swap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameBufferPair {
    slots: [ImageHandle; 2],
    current: usize,
    written: bool,
    primed: bool,
    width: u32,
    height: u32,
}

impl FrameBufferPair {
    /// Allocate both slots on the backend.
    pub fn new<B: ComputeBackend>(backend: &mut B, width: u32, height: u32) -> Result<Self, BackendError> {
        let a = backend.create_image(width, height)?;
        let b = backend.create_image(width, height)?;
        Ok(Self::from_handles(a, b, width, height))
    }

    /// Wrap two existing images. `a` starts as current.
    pub fn from_handles(a: ImageHandle, b: ImageHandle, width: u32, height: u32) -> Self {
        FrameBufferPair {
            slots: [a, b],
            current: 0,
            written: false,
            primed: false,
            width,
            height,
        }
    }

    #[inline]
    pub fn current(&self) -> ImageHandle {
        self.slots[self.current]
    }

    #[inline]
    pub fn reference(&self) -> ImageHandle {
        self.slots[self.current ^ 1]
    }

    /// Exchange current and reference.
    pub fn swap(&mut self) {
        self.current ^= 1;
        self.primed = self.written;
        self.written = false;
    }

    /// Record that the current slot now holds this frame's pixels.
    pub fn mark_written(&mut self) {
        self.written = true;
    }

    /// True when the reference slot holds a previous frame.
    pub fn is_primed(&self) -> bool {
        self.primed
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn release<B: ComputeBackend>(self, backend: &mut B) {
        for h in self.slots {
            backend.release_image(h);
        }
    }
}

// ---------------------------------------------------------------------------
// Coarse pyramid pairs
// ---------------------------------------------------------------------------

/// Dimensions of a picture downsampled by the tier's factor.
pub fn level_size(width: u32, height: u32, tier: Tier) -> (u32, u32) {
    let f = tier.factor();
    (units(width, f), units(height, f))
}

/// Ping-pong pairs for the 2×, 4× and 8× levels of one picture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierImages {
    pairs: [FrameBufferPair; 3],
}

impl TierImages {
    pub fn new<B: ComputeBackend>(backend: &mut B, width: u32, height: u32) -> Result<Self, BackendError> {
        let mk = |backend: &mut B, tier| {
            let (w, h) = level_size(width, height, tier);
            FrameBufferPair::new(backend, w, h)
        };
        Ok(TierImages {
            pairs: [
                mk(backend, Tier::Half)?,
                mk(backend, Tier::Quarter)?,
                mk(backend, Tier::Eighth)?,
            ],
        })
    }

    fn slot(tier: Tier) -> usize {
        match tier {
            Tier::Full | Tier::Half => 0,
            Tier::Quarter => 1,
            Tier::Eighth => 2,
        }
    }

    /// The pair holding `tier`. `Tier::Full` is not stored here and maps to
    /// the 2× pair.
    pub fn pair(&self, tier: Tier) -> &FrameBufferPair {
        &self.pairs[Self::slot(tier)]
    }

    /// Current images in downsample-output order (2×, 4×, 8×).
    pub fn currents(&self) -> [ImageHandle; 3] {
        [self.pairs[0].current(), self.pairs[1].current(), self.pairs[2].current()]
    }

    pub fn swap_all(&mut self) {
        for p in &mut self.pairs {
            p.swap();
        }
    }

    pub fn mark_written(&mut self) {
        for p in &mut self.pairs {
            p.mark_written();
        }
    }

    pub fn is_primed(&self) -> bool {
        self.pairs.iter().all(FrameBufferPair::is_primed)
    }

    pub fn release<B: ComputeBackend>(self, backend: &mut B) {
        for p in self.pairs {
            p.release(backend);
        }
    }
}

// ---------------------------------------------------------------------------
// Predictor buffers
// ---------------------------------------------------------------------------

/// One predictor buffer per coarse tier, each sized from its own grid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PredictorBuffers {
    buffers: [BufferHandle; 3],
    counts: [u32; 3],
}

impl PredictorBuffers {
    pub fn new<B: ComputeBackend>(backend: &mut B, width: u32, height: u32) -> Result<Self, BackendError> {
        let mut buffers = Vec::with_capacity(3);
        let mut counts = [0u32; 3];
        for (i, tier) in [Tier::Half, Tier::Quarter, Tier::Eighth].into_iter().enumerate() {
            counts[i] = predictor_count(width, height, tier);
            let bytes = predictor_bytes(width, height, tier);
            trace!(?tier, elements = counts[i], bytes, "predictor buffer");
            buffers.push(backend.create_buffer(bytes)?);
        }
        Ok(PredictorBuffers { buffers: [buffers[0], buffers[1], buffers[2]], counts })
    }

    /// The buffer produced at `tier`.
    pub fn get(&self, tier: Tier) -> BufferHandle {
        self.buffers[TierImages::slot(tier)]
    }

    /// Element count of the buffer produced at `tier`.
    pub fn count(&self, tier: Tier) -> u32 {
        self.counts[TierImages::slot(tier)]
    }

    pub fn release<B: ComputeBackend>(self, backend: &mut B) {
        for b in self.buffers {
            backend.release_buffer(b);
        }
    }
}

// ---------------------------------------------------------------------------
// Refinement outputs
// ---------------------------------------------------------------------------

/// Vector, residual and shape buffers for one picture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultBuffers {
    pub grid: MacroblockGrid,
    pub mvs: BufferHandle,
    pub residuals: BufferHandle,
    pub shapes: BufferHandle,
}

impl ResultBuffers {
    pub fn new<B: ComputeBackend>(backend: &mut B, grid: MacroblockGrid) -> Result<Self, BackendError> {
        let sub = grid.subblock_count();
        Ok(ResultBuffers {
            grid,
            mvs: backend.create_buffer(sub * 4)?,
            residuals: backend.create_buffer(sub * 2)?,
            shapes: backend.create_buffer(grid.mb_count() * 4)?,
        })
    }

    /// Read all three fields back. Call after `finish()`.
    pub fn read<B: ComputeBackend>(&self, backend: &mut B) -> Result<FrameResults, BackendError> {
        let sub = self.grid.subblock_count();
        let mv_words = backend.read_buffer(self.mvs, sub)?;
        let res_words = backend.read_buffer(self.residuals, sub / 2)?;
        let shape_words = backend.read_buffer(self.shapes, self.grid.mb_count())?;
        Ok(FrameResults {
            mvs: MotionVectorField::from_words(self.grid, &mv_words),
            shapes: ShapeField::from_words(self.grid, &shape_words),
            residuals: ResidualField::from_words(self.grid, &res_words),
        })
    }

    /// Words in the residual buffer (two residuals per word).
    pub fn residual_words(&self) -> usize {
        self.grid.mb_count() * SUBBLOCKS_PER_MB / 2
    }

    pub fn release<B: ComputeBackend>(self, backend: &mut B) {
        backend.release_buffer(self.mvs);
        backend.release_buffer(self.residuals);
        backend.release_buffer(self.shapes);
    }
}
