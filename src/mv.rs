// mv.rs — motion vectors, macroblock grids, pyramid tiers and result fields.
//
// ELEMENT LAYOUT CONTRACT
// ───────────────────────
// Every vector that crosses the host/device boundary is two signed 16-bit
// components, x then y, in quarter-pel units, packed into one 32-bit word:
//
//   bits  0..16  x (i16, two's complement)
//   bits 16..32  y (i16, two's complement)
//
// On a little-endian host this is exactly the byte layout of
// `#[repr(C)] MotionVector { x: i16, y: i16 }`, so device words are viewed
// as vectors with `bytemuck::cast_slice` instead of a pointer cast.
//
// BUFFER ORDER
// ────────────
// Per-4×4 outputs (vectors, residuals) are macroblock-major: macroblock
// `mb = y * mb_width + x` owns entries `mb*16 .. mb*16+16`, raster order
// inside the macroblock. Predictor buffers hold MV_PER_DIM hints per tier
// macroblock, one per 8×8 quadrant (raster order), which is one hint per
// macroblock of the next finer tier.

use bytemuck::{Pod, Zeroable};

use crate::align::{align64, align_page, units, MB_SIZE};
use crate::image::Image;

/// Predictor hints emitted per tier macroblock (one per 8×8 quadrant).
pub const MV_PER_DIM: u32 = 4;

/// 4×4 sub-blocks per macroblock.
pub const SUBBLOCKS_PER_MB: usize = 16;

// ---------------------------------------------------------------------------
// MotionVector
// ---------------------------------------------------------------------------

/// A 2D motion vector in quarter-pel units.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Pod, Zeroable)]
pub struct MotionVector {
    pub x: i16,
    pub y: i16,
}

impl MotionVector {
    pub const ZERO: MotionVector = MotionVector { x: 0, y: 0 };

    pub const fn new(x: i16, y: i16) -> Self {
        MotionVector { x, y }
    }

    /// Pack into the device word layout.
    #[inline]
    pub fn pack(self) -> u32 {
        (self.x as u16 as u32) | ((self.y as u16 as u32) << 16)
    }

    #[inline]
    pub fn unpack(word: u32) -> Self {
        MotionVector {
            x: (word & 0xffff) as u16 as i16,
            y: (word >> 16) as u16 as i16,
        }
    }

    /// Double both components, saturating. Used when a hint moves one tier
    /// finer.
    #[inline]
    pub fn scaled_up(self) -> Self {
        MotionVector {
            x: self.x.saturating_mul(2),
            y: self.y.saturating_mul(2),
        }
    }

    #[inline]
    pub fn is_zero(self) -> bool {
        self.x == 0 && self.y == 0
    }
}

/// View device words as motion vectors without copying.
pub fn mv_view(words: &[u32]) -> &[MotionVector] {
    bytemuck::cast_slice(words)
}

// ---------------------------------------------------------------------------
// Tiers and grids
// ---------------------------------------------------------------------------

/// One resolution level of the pyramid.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Tier {
    Full,
    Half,
    Quarter,
    Eighth,
}

impl Tier {
    /// Coarse tiers in cascade order (coarsest first).
    pub const CASCADE: [Tier; 3] = [Tier::Eighth, Tier::Quarter, Tier::Half];

    pub const ALL: [Tier; 4] = [Tier::Full, Tier::Half, Tier::Quarter, Tier::Eighth];

    /// Downsample factor relative to full resolution.
    pub const fn factor(self) -> u32 {
        match self {
            Tier::Full => 1,
            Tier::Half => 2,
            Tier::Quarter => 4,
            Tier::Eighth => 8,
        }
    }

    /// The next coarser tier, if any.
    pub const fn coarser(self) -> Option<Tier> {
        match self {
            Tier::Full => Some(Tier::Half),
            Tier::Half => Some(Tier::Quarter),
            Tier::Quarter => Some(Tier::Eighth),
            Tier::Eighth => None,
        }
    }

    /// Position in `Tier::ALL`.
    pub const fn index(self) -> usize {
        match self {
            Tier::Full => 0,
            Tier::Half => 1,
            Tier::Quarter => 2,
            Tier::Eighth => 3,
        }
    }
}

/// Macroblock grid covering a `width × height` picture.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct MacroblockGrid {
    pub width: u32,
    pub height: u32,
    pub mb_width: u32,
    pub mb_height: u32,
}

impl MacroblockGrid {
    pub fn new(width: u32, height: u32) -> Self {
        MacroblockGrid {
            width,
            height,
            mb_width: units(width, MB_SIZE),
            mb_height: units(height, MB_SIZE),
        }
    }

    /// Grid of the downsampled picture at `tier`.
    pub fn at_tier(&self, tier: Tier) -> MacroblockGrid {
        let f = tier.factor();
        MacroblockGrid::new(units(self.width, f), units(self.height, f))
    }

    pub fn mb_count(&self) -> usize {
        self.mb_width as usize * self.mb_height as usize
    }

    /// Pixel width rounded up to whole macroblocks.
    pub fn aligned_width(&self) -> u32 {
        self.mb_width * MB_SIZE
    }

    pub fn aligned_height(&self) -> u32 {
        self.mb_height * MB_SIZE
    }

    /// Entries in a per-4×4 field (`mb_width*4 × mb_height*4`).
    pub fn subblock_count(&self) -> usize {
        self.mb_count() * SUBBLOCKS_PER_MB
    }
}

/// Element count of the predictor buffer produced at a coarse tier.
///
/// Always derived from the tier's own macroblock grid.
pub fn predictor_count(width: u32, height: u32, tier: Tier) -> u32 {
    let f = tier.factor();
    let mb_w = units(units(width, f), MB_SIZE);
    let mb_h = units(units(height, f), MB_SIZE);
    align64(mb_w * mb_h * MV_PER_DIM)
}

/// Byte size of a predictor buffer, page-aligned for zero-copy sharing.
pub fn predictor_bytes(width: u32, height: u32, tier: Tier) -> usize {
    align_page(predictor_count(width, height, tier) as usize * std::mem::size_of::<u32>())
}

// ---------------------------------------------------------------------------
// Partition shapes
// ---------------------------------------------------------------------------

/// How a macroblock was partitioned for estimation.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum ShapeCode {
    #[default]
    Shape16x16 = 0,
    Shape16x8 = 1,
    Shape8x16 = 2,
    Shape8x8 = 3,
}

impl ShapeCode {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(ShapeCode::Shape16x16),
            1 => Some(ShapeCode::Shape16x8),
            2 => Some(ShapeCode::Shape8x16),
            3 => Some(ShapeCode::Shape8x8),
            _ => None,
        }
    }

    /// Number of independently-estimated partitions.
    pub fn partitions(self) -> usize {
        match self {
            ShapeCode::Shape16x16 => 1,
            ShapeCode::Shape16x8 | ShapeCode::Shape8x16 => 2,
            ShapeCode::Shape8x8 => 4,
        }
    }
}

// ---------------------------------------------------------------------------
// Result fields
// ---------------------------------------------------------------------------

/// One vector per 4×4 sub-block, macroblock-major.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MotionVectorField {
    pub grid: MacroblockGrid,
    pub vectors: Vec<MotionVector>,
}

impl MotionVectorField {
    pub fn from_words(grid: MacroblockGrid, words: &[u32]) -> Self {
        let n = grid.subblock_count();
        MotionVectorField { grid, vectors: mv_view(&words[..n]).to_vec() }
    }

    /// Vector of sub-block `sub` (0..16, raster) of macroblock (mb_x, mb_y).
    pub fn get(&self, mb_x: u32, mb_y: u32, sub: usize) -> MotionVector {
        let mb = (mb_y * self.grid.mb_width + mb_x) as usize;
        self.vectors[mb * SUBBLOCKS_PER_MB + sub]
    }

    /// Vector of the 4×4 block at block coordinates (bx, by) in the
    /// `mb_width*4 × mb_height*4` block raster.
    pub fn at_block(&self, bx: u32, by: u32) -> MotionVector {
        let sub = ((by % 4) * 4 + (bx % 4)) as usize;
        self.get(bx / 4, by / 4, sub)
    }

    pub fn all_zero(&self) -> bool {
        self.vectors.iter().all(|v| v.is_zero())
    }
}

/// One partition shape per macroblock.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShapeField {
    pub grid: MacroblockGrid,
    pub shapes: Vec<ShapeCode>,
}

impl ShapeField {
    /// Decode one device word per macroblock. Unknown codes fall back to
    /// 16×16.
    pub fn from_words(grid: MacroblockGrid, words: &[u32]) -> Self {
        let shapes = words[..grid.mb_count()]
            .iter()
            .map(|&w| ShapeCode::from_u32(w).unwrap_or_default())
            .collect();
        ShapeField { grid, shapes }
    }

    pub fn get(&self, mb_x: u32, mb_y: u32) -> ShapeCode {
        self.shapes[(mb_y * self.grid.mb_width + mb_x) as usize]
    }
}

/// One distortion value per 4×4 sub-block, macroblock-major.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResidualField {
    pub grid: MacroblockGrid,
    pub values: Vec<u16>,
}

impl ResidualField {
    /// Device words carry two residuals each, low half first.
    pub fn from_words(grid: MacroblockGrid, words: &[u32]) -> Self {
        let n = grid.subblock_count();
        let halves: &[u16] = bytemuck::cast_slice(&words[..n / 2]);
        ResidualField { grid, values: halves.to_vec() }
    }

    pub fn all_zero(&self) -> bool {
        self.values.iter().all(|&v| v == 0)
    }

    /// Residuals laid out spatially as a `mb_width*4 × mb_height*4` image.
    pub fn to_image(&self) -> Image<u16> {
        let bw = (self.grid.mb_width * 4) as usize;
        let bh = (self.grid.mb_height * 4) as usize;
        let mut img = Image::new(bw, bh);
        for (i, &v) in self.values.iter().enumerate() {
            let mb = i / SUBBLOCKS_PER_MB;
            let sub = i % SUBBLOCKS_PER_MB;
            let mb_x = mb % self.grid.mb_width as usize;
            let mb_y = mb / self.grid.mb_width as usize;
            img.set(mb_x * 4 + sub % 4, mb_y * 4 + sub / 4, v);
        }
        img
    }
}

/// Everything the refinement stage produces for one picture.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FrameResults {
    pub mvs: MotionVectorField,
    pub shapes: ShapeField,
    pub residuals: ResidualField,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_round_trip_negative() {
        let mv = MotionVector::new(-3, 17);
        let w = mv.pack();
        assert_eq!(w & 0xffff, 0xfffd);
        assert_eq!(w >> 16, 17);
        assert_eq!(MotionVector::unpack(w), mv);
    }

    #[test]
    fn test_pack_matches_byte_view() {
        let words = [MotionVector::new(5, -2).pack(), MotionVector::new(-128, 64).pack()];
        let view = mv_view(&words);
        assert_eq!(view[0], MotionVector::new(5, -2));
        assert_eq!(view[1], MotionVector::new(-128, 64));
    }

    #[test]
    fn test_scaled_up_saturates() {
        assert_eq!(MotionVector::new(3, -4).scaled_up(), MotionVector::new(6, -8));
        assert_eq!(MotionVector::new(i16::MAX, i16::MIN).scaled_up(),
                   MotionVector::new(i16::MAX, i16::MIN));
    }

    #[test]
    fn test_grid_720p() {
        let g = MacroblockGrid::new(1280, 720);
        assert_eq!(g.mb_width, 80);
        assert_eq!(g.mb_height, 45);
        assert_eq!(g.aligned_height(), 720);
        assert_eq!(g.subblock_count(), 80 * 45 * 16);
    }

    #[test]
    fn test_grid_at_tier_uses_tier_pixels() {
        let g = MacroblockGrid::new(176, 144);
        let g8 = g.at_tier(Tier::Eighth);
        assert_eq!((g8.width, g8.height), (22, 18));
        assert_eq!((g8.mb_width, g8.mb_height), (2, 2));
        let g2 = g.at_tier(Tier::Half);
        assert_eq!((g2.mb_width, g2.mb_height), (6, 5));
    }

    #[test]
    fn test_tier_chain() {
        assert_eq!(Tier::Full.coarser(), Some(Tier::Half));
        assert_eq!(Tier::Eighth.coarser(), None);
        assert_eq!(Tier::CASCADE.map(Tier::factor), [8, 4, 2]);
        for (i, t) in Tier::ALL.iter().enumerate() {
            assert_eq!(t.index(), i);
        }
    }

    #[test]
    fn test_predictor_bytes_page_aligned() {
        let b = predictor_bytes(1280, 720, Tier::Half);
        assert_eq!(b % 4096, 0);
        assert!(b >= predictor_count(1280, 720, Tier::Half) as usize * 4);
    }

    #[test]
    fn test_shape_code_decode() {
        assert_eq!(ShapeCode::from_u32(2), Some(ShapeCode::Shape8x16));
        assert_eq!(ShapeCode::from_u32(9), None);
        assert_eq!(ShapeCode::Shape8x8.partitions(), 4);
    }

    #[test]
    fn test_residual_words_low_half_first() {
        let grid = MacroblockGrid::new(16, 16);
        let mut words = vec![0u32; 8];
        words[0] = 7 | (9 << 16);
        let r = ResidualField::from_words(grid, &words);
        assert_eq!(r.values.len(), 16);
        assert_eq!(r.values[0], 7);
        assert_eq!(r.values[1], 9);
    }

    #[test]
    fn test_mv_field_block_addressing() {
        let grid = MacroblockGrid::new(32, 16);
        let mut words = vec![0u32; grid.subblock_count()];
        // Macroblock 1, sub-block 5 → block raster (4+1, 1).
        words[16 + 5] = MotionVector::new(8, -4).pack();
        let f = MotionVectorField::from_words(grid, &words);
        assert_eq!(f.at_block(5, 1), MotionVector::new(8, -4));
        assert_eq!(f.get(1, 0, 5), MotionVector::new(8, -4));
        assert!(!f.all_zero());
    }

    #[test]
    fn test_residual_to_image() {
        let grid = MacroblockGrid::new(32, 16);
        let mut values = vec![0u16; grid.subblock_count()];
        values[16 + 15] = 99;
        let r = ResidualField { grid, values };
        let img = r.to_image();
        assert_eq!((img.width(), img.height()), (8, 4));
        assert_eq!(img.get(7, 3), 99);
    }
}
