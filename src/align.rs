// align.rs — integer rounding helpers for macroblock, SIMD and page extents.
//
// Every buffer size and dispatch extent in the pipeline goes through one of
// these. The accelerator works on whole 16×16 macroblocks and 16-lane work
// groups, so a raw pixel dimension is never used directly.
//
// Two families:
//
//   align_*  → a multiple of `unit` that is ≥ x      (pixel / byte extents)
//   units    → how many `unit`s are needed to cover x  (grid counts)
//
// They are related by  align_units(x, u) == units(x, u) * u.
//
//   align_units(100, 16) = 112      units(100, 16) = 7
//   align_units(112, 16) = 112      units(112, 16) = 7
//   align_units(0, 16)   = 0        units(0, 16)   = 0

/// Macroblock edge length in pixels.
pub const MB_SIZE: u32 = 16;

/// Lanes per work group for every kernel in the pipeline.
pub const SIMD_SIZE: u32 = 16;

/// Page size used for zero-copy host-visible allocations.
pub const PAGE_SIZE: usize = 4096;

/// Round `x` up to the next multiple of `unit`.
///
/// The result lies in `[x, x + unit)` and is divisible by `unit`.
#[inline]
pub fn align_units(x: u32, unit: u32) -> u32 {
    debug_assert!(unit > 0, "align_units: unit must be positive");
    (x + unit - 1) / unit * unit
}

/// Number of `unit`-sized cells needed to cover `x` (ceiling division).
#[inline]
pub fn units(x: u32, unit: u32) -> u32 {
    debug_assert!(unit > 0, "units: unit must be positive");
    (x + unit - 1) / unit
}

#[inline]
pub fn align16(x: u32) -> u32 {
    align_units(x, 16)
}

#[inline]
pub fn align64(x: u32) -> u32 {
    align_units(x, 64)
}

/// Round a byte count up to a whole number of pages.
#[inline]
pub fn align_page(bytes: usize) -> usize {
    (bytes + PAGE_SIZE - 1) / PAGE_SIZE * PAGE_SIZE
}
