// kernels.rs — host reference implementations of the four compute kernels.
//
// These functions are what `CpuBackend::enqueue_kernel` runs, and they are
// the behavioural reference for the WGSL in src/shaders/. Every formula
// here has a line-for-line counterpart in a shader; if one changes, the
// other must change with it.
//
// WORK DECOMPOSITION
// ──────────────────
// The host loops walk the same global extent the device dispatch uses, so a
// dispatch whose extent is wrong produces wrong (or missing) output on both
// backends, not just on the GPU.
//
//   downsample   work item (gx, gy) owns the 4×16 full-res strip at
//                (4·gx, 16·gy) and writes every level-f pixel whose
//                top-left sample falls inside the strip.
//   hme_tier     work group (gx, gy) is tier macroblock (gx, gy).
//   refine       work group gx is macroblock column gx; rows in order.
//   refine_wpp   work group t owns rows t, t+T, t+2T, … and runs as a real
//                OS thread, gated by the atomic scoreboard.
//
// COST MODEL
// ──────────
//   cost(mv) = distortion(mv) + lambda · rate(mv − mvp)
//   rate(d)  = 2·bitlen(|d.x|) + 2·bitlen(|d.y|)
//
// Candidates are compared by (cost, |mv|₁, candidate index), where index 0
// is always the search centre. A flat picture therefore resolves to the
// zero vector at every stage.

use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::align::{units, MB_SIZE};
use crate::backend::KernelParams;
use crate::error::BackendError;
use crate::image::Image;
use crate::mv::{MotionVector, ShapeCode, MV_PER_DIM, SUBBLOCKS_PER_MB};

/// `sad_adjust` value selecting the 4×4 Hadamard distortion.
pub const SAD_ADJUST_HAAR: u32 = 2;

/// Search centres are clamped to this many pixels so quarter-pel vectors
/// always fit in i16.
const MV_LIMIT: i32 = 2000;

// Sub-block masks over the 16 4×4 blocks of a macroblock (bit = row*4+col).
const MASK_ALL: u16 = 0xFFFF;
const MASK_Q0: u16 = 0x0033;
const MASK_Q1: u16 = 0x00CC;
const MASK_Q2: u16 = 0x3300;
const MASK_Q3: u16 = 0xCC00;
const MASK_TOP: u16 = 0x00FF;
const MASK_BOTTOM: u16 = 0xFF00;
const MASK_LEFT: u16 = 0x3333;
const MASK_RIGHT: u16 = 0xCCCC;

/// Regions tracked during the integer search, in tracker order.
const TRACKERS: [u16; 9] = [
    MASK_ALL, MASK_Q0, MASK_Q1, MASK_Q2, MASK_Q3, MASK_TOP, MASK_BOTTOM, MASK_LEFT, MASK_RIGHT,
];

// ---------------------------------------------------------------------------
// Pixel access
// ---------------------------------------------------------------------------

/// A read view of an image as the kernels see it: clamp-to-edge, and in
/// interlaced mode only the lines of one field.
#[derive(Clone, Copy)]
pub(crate) struct Plane<'a> {
    img: &'a Image<u8>,
    interlaced: bool,
    polarity: i32,
}

impl<'a> Plane<'a> {
    pub(crate) fn progressive(img: &'a Image<u8>) -> Self {
        Plane { img, interlaced: false, polarity: 0 }
    }

    /// Full-resolution view honouring the dispatch's field selection.
    pub(crate) fn full_res(img: &'a Image<u8>, params: &KernelParams) -> Self {
        Plane {
            img,
            interlaced: params.interlaced != 0,
            polarity: (params.polarity & 1) as i32,
        }
    }

    fn height(&self) -> i32 {
        if self.interlaced {
            self.img.height() as i32 / 2
        } else {
            self.img.height() as i32
        }
    }

    #[inline]
    pub(crate) fn at(&self, x: i32, y: i32) -> i32 {
        if self.interlaced {
            let h = self.height();
            if h <= 0 {
                return 0;
            }
            let fy = y.clamp(0, h - 1);
            self.img.get_clamped(x, 2 * fy + self.polarity) as i32
        } else {
            self.img.get_clamped(x, y) as i32
        }
    }

    /// Bilinear sample at a quarter-pel position.
    #[inline]
    pub(crate) fn at_qpel(&self, qx: i32, qy: i32) -> i32 {
        let (ix, fx) = (qx >> 2, qx & 3);
        let (iy, fy) = (qy >> 2, qy & 3);
        if fx == 0 && fy == 0 {
            return self.at(ix, iy);
        }
        let a = self.at(ix, iy);
        let b = self.at(ix + 1, iy);
        let c = self.at(ix, iy + 1);
        let d = self.at(ix + 1, iy + 1);
        (a * (4 - fx) * (4 - fy) + b * fx * (4 - fy) + c * (4 - fx) * fy + d * fx * fy + 8) >> 4
    }
}

// ---------------------------------------------------------------------------
// Cost primitives
// ---------------------------------------------------------------------------

#[inline]
fn bit_len(v: i32) -> u32 {
    32 - v.unsigned_abs().leading_zeros()
}

/// Bits-proxy for coding the vector difference `(dx, dy)`.
#[inline]
pub(crate) fn mv_rate(dx: i32, dy: i32) -> u32 {
    2 * bit_len(dx) + 2 * bit_len(dy)
}

#[inline]
fn mv_len(mv: MotionVector) -> u32 {
    (mv.x as i32).unsigned_abs() + (mv.y as i32).unsigned_abs()
}

/// Round a quarter-pel component to the nearest integer pixel.
#[inline]
pub(crate) fn int_of(q: i32) -> i32 {
    (q + 2) >> 2
}

#[inline]
fn clamp_int(p: i32) -> i32 {
    p.clamp(-MV_LIMIT, MV_LIMIT)
}

/// Quarter-pel vector for an integer-pel position.
#[inline]
fn qpel(px: i32, py: i32) -> MotionVector {
    MotionVector::new((px * 4) as i16, (py * 4) as i16)
}

/// Sum of absolute 4×4 Hadamard coefficients, halved.
pub(crate) fn satd4x4(diff: &[[i32; 4]; 4]) -> u32 {
    let mut m = [[0i32; 4]; 4];
    for (j, row) in diff.iter().enumerate() {
        let a0 = row[0] + row[1];
        let a1 = row[0] - row[1];
        let a2 = row[2] + row[3];
        let a3 = row[2] - row[3];
        m[j] = [a0 + a2, a1 + a3, a0 - a2, a1 - a3];
    }
    let mut sum = 0u32;
    for i in 0..4 {
        let a0 = m[0][i] + m[1][i];
        let a1 = m[0][i] - m[1][i];
        let a2 = m[2][i] + m[3][i];
        let a3 = m[2][i] - m[3][i];
        sum += (a0 + a2).unsigned_abs()
            + (a1 + a3).unsigned_abs()
            + (a0 - a2).unsigned_abs()
            + (a1 - a3).unsigned_abs();
    }
    sum >> 1
}

/// Distortion of the 4×4 block at (bx, by) displaced by a quarter-pel `mv`.
fn block_distortion(cur: Plane, refp: Plane, bx: i32, by: i32, mv: MotionVector, sad_adjust: u32) -> u32 {
    let mut diff = [[0i32; 4]; 4];
    let mut sad = 0u32;
    for (j, row) in diff.iter_mut().enumerate() {
        for (i, d) in row.iter_mut().enumerate() {
            let x = bx + i as i32;
            let y = by + j as i32;
            let c = cur.at(x, y);
            let r = refp.at_qpel(x * 4 + mv.x as i32, y * 4 + mv.y as i32);
            *d = c - r;
            sad += (c - r).unsigned_abs();
        }
    }
    if sad_adjust == SAD_ADJUST_HAAR {
        satd4x4(&diff)
    } else {
        sad
    }
}

/// Integer SAD of the `size × size` block at (bx, by) against (bx+px, by+py).
fn block_sad(cur: Plane, refp: Plane, bx: i32, by: i32, size: i32, px: i32, py: i32) -> u32 {
    let mut sad = 0u32;
    for y in by..by + size {
        for x in bx..bx + size {
            sad += (cur.at(x, y) - refp.at(x + px, y + py)).unsigned_abs();
        }
    }
    sad
}

/// Best-so-far for one region.
#[derive(Clone, Copy, Debug)]
struct Best {
    cost: u32,
    len: u32,
    index: u32,
    mv: MotionVector,
}

impl Best {
    const NONE: Best = Best { cost: u32::MAX, len: u32::MAX, index: u32::MAX, mv: MotionVector::ZERO };

    #[inline]
    fn offer(&mut self, cost: u32, mv: MotionVector, index: u32) {
        let len = mv_len(mv);
        if (cost, len, index) < (self.cost, self.len, self.index) {
            *self = Best { cost, len, index, mv };
        }
    }
}

/// Window offsets in candidate order: centre first (index 0), then the
/// remaining positions in raster order.
fn window(range: i32) -> impl Iterator<Item = (u32, i32, i32)> {
    let side = 2 * range + 1;
    (0..side * side).map(move |k| {
        let dx = k % side - range;
        let dy = k / side - range;
        let index = if dx == 0 && dy == 0 { 0 } else { k as u32 + 1 };
        (index, dx, dy)
    })
}

/// The hint for macroblock (x, y) from a predictor buffer built one tier
/// coarser: quadrant (x%2, y%2) of coarse macroblock (x/2, y/2).
pub(crate) fn predictor_hint(pred: &[u32], pred_mb_width: u32, x: u32, y: u32) -> MotionVector {
    let idx = ((y / 2) * pred_mb_width + x / 2) * MV_PER_DIM + (y % 2) * 2 + (x % 2);
    pred.get(idx as usize)
        .map(|&w| MotionVector::unpack(w))
        .unwrap_or_default()
}

fn check_len(kernel: &'static str, what: &str, have: usize, need: usize) -> Result<(), BackendError> {
    if have < need {
        return Err(BackendError::InvalidArgument {
            kernel,
            reason: format!("{what} holds {have} elements, dispatch needs {need}"),
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// downsample
// ---------------------------------------------------------------------------

/// Build the 2×, 4× and 8× levels of `src` into `dsts` (in that order).
pub(crate) fn downsample(
    params: &KernelParams,
    global: [u32; 2],
    src: &Image<u8>,
    dsts: [&mut Image<u8>; 3],
) -> Result<(), BackendError> {
    let cur = Plane::full_res(src, params);
    let (w, h) = (params.width, params.height);

    for (dst, f) in dsts.iter().zip([2u32, 4, 8]) {
        let (ow, oh) = (units(w, f) as usize, units(h, f) as usize);
        if dst.width() < ow || dst.height() < oh {
            return Err(BackendError::InvalidArgument {
                kernel: "downsample",
                reason: format!("{f}x level is {}x{}, needs {ow}x{oh}", dst.width(), dst.height()),
            });
        }
    }

    let [d2, d4, d8] = dsts;
    let mut levels = [(d2, 2u32), (d4, 4), (d8, 8)];
    for gy in 0..global[1] {
        for gx in 0..global[0] {
            let (x0, y0) = (gx * 4, gy * 16);
            if x0 >= w || y0 >= h {
                continue;
            }
            for (dst, f) in levels.iter_mut() {
                let f = *f;
                let area = f * f;
                let ox_end = units(x0 + 4, f).min(units(w, f));
                let oy_end = units(y0 + 16, f).min(units(h, f));
                for oy in units(y0, f)..oy_end {
                    for ox in units(x0, f)..ox_end {
                        let mut sum = 0u32;
                        for j in 0..f {
                            for i in 0..f {
                                sum += cur.at((ox * f + i) as i32, (oy * f + j) as i32) as u32;
                            }
                        }
                        dst.set(ox as usize, oy as usize, ((sum + area / 2) / area) as u8);
                    }
                }
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// hme_tier
// ---------------------------------------------------------------------------

/// One tier of the predictor cascade: four 8×8 quadrant vectors per tier
/// macroblock, searched around the scaled hint from the coarser tier.
pub(crate) fn hme_tier(
    params: &KernelParams,
    groups: [u32; 2],
    src: &Image<u8>,
    refr: &Image<u8>,
    pred_in: Option<&[u32]>,
    pred_out: &mut [u32],
) -> Result<(), BackendError> {
    let (mb_w, mb_h) = (params.mb_width, params.mb_height);
    check_len("hme_tier", "pred_out", pred_out.len(), (mb_w * mb_h * MV_PER_DIM) as usize)?;

    let cur = Plane::progressive(src);
    let refp = Plane::progressive(refr);
    let range = params.search_range as i32;
    let lambda = params.lambda;

    for gy in 0..groups[1].min(mb_h) {
        for gx in 0..groups[0].min(mb_w) {
            let mvp = pred_in
                .map(|p| predictor_hint(p, params.pred_mb_width, gx, gy).scaled_up())
                .unwrap_or_default();
            let cx = clamp_int(int_of(mvp.x as i32));
            let cy = clamp_int(int_of(mvp.y as i32));
            let (bx, by) = ((gx * MB_SIZE) as i32, (gy * MB_SIZE) as i32);

            let mut best = [Best::NONE; 4];
            for (index, dx, dy) in window(range) {
                let (px, py) = (cx + dx, cy + dy);
                let mv = qpel(px, py);
                let rate = lambda * mv_rate(mv.x as i32 - mvp.x as i32, mv.y as i32 - mvp.y as i32);
                for (q, b) in best.iter_mut().enumerate() {
                    let qx = bx + (q as i32 % 2) * 8;
                    let qy = by + (q as i32 / 2) * 8;
                    let sad = block_sad(cur, refp, qx, qy, 8, px, py);
                    b.offer(sad + rate, mv, index);
                }
            }

            let mb = (gy * mb_w + gx) * MV_PER_DIM;
            for (q, b) in best.iter().enumerate() {
                pred_out[mb as usize + q] = b.mv.pack();
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// refine
// ---------------------------------------------------------------------------

/// Per-macroblock refinement output.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct MbResult {
    pub mvs: [MotionVector; SUBBLOCKS_PER_MB],
    pub residuals: [u16; SUBBLOCKS_PER_MB],
    pub shape: ShapeCode,
}

impl MbResult {
    /// The vector the macroblock below uses as its spatial candidate.
    fn bottom_left(&self) -> MotionVector {
        self.mvs[12]
    }
}

struct RefineCtx<'a> {
    cur: Plane<'a>,
    refp: Plane<'a>,
    pred: &'a [u32],
    pred_mb_width: u32,
    lambda: u32,
    sad_adjust: u32,
    subpel: u32,
    range: i32,
}

impl<'a> RefineCtx<'a> {
    fn new(params: &KernelParams, src: &'a Image<u8>, refr: &'a Image<u8>, pred: &'a [u32]) -> Self {
        RefineCtx {
            cur: Plane::full_res(src, params),
            refp: Plane::full_res(refr, params),
            pred,
            pred_mb_width: params.pred_mb_width,
            lambda: params.lambda,
            sad_adjust: params.sad_adjust,
            subpel: params.subpel,
            range: params.search_range as i32,
        }
    }

    fn rate(&self, mv: MotionVector, mvp: MotionVector) -> u32 {
        self.lambda * mv_rate(mv.x as i32 - mvp.x as i32, mv.y as i32 - mvp.y as i32)
    }

    /// Distortion of every 4×4 block of macroblock origin (bx, by) at `mv`.
    fn block_costs(&self, bx: i32, by: i32, mv: MotionVector) -> [u32; SUBBLOCKS_PER_MB] {
        let mut d = [0u32; SUBBLOCKS_PER_MB];
        for (s, v) in d.iter_mut().enumerate() {
            let x = bx + (s as i32 % 4) * 4;
            let y = by + (s as i32 / 4) * 4;
            *v = block_distortion(self.cur, self.refp, x, y, mv, self.sad_adjust);
        }
        d
    }

    fn region_cost(&self, bx: i32, by: i32, mask: u16, mv: MotionVector) -> u32 {
        let mut sum = 0u32;
        for s in 0..SUBBLOCKS_PER_MB {
            if mask & (1 << s) != 0 {
                let x = bx + (s as i32 % 4) * 4;
                let y = by + (s as i32 / 4) * 4;
                sum += block_distortion(self.cur, self.refp, x, y, mv, self.sad_adjust);
            }
        }
        sum
    }

    /// Refine one partition around its integer winner at `step` quarter-pels.
    fn subpel_step(&self, bx: i32, by: i32, mask: u16, start: Best, mvp: MotionVector, step: i16) -> Best {
        let mut best = Best { index: 0, ..start };
        let mut index = 1;
        for dy in -1i16..=1 {
            for dx in -1i16..=1 {
                if dx == 0 && dy == 0 {
                    continue;
                }
                let mv = MotionVector::new(start.mv.x + dx * step, start.mv.y + dy * step);
                let cost = self.region_cost(bx, by, mask, mv) + self.rate(mv, mvp);
                best.offer(cost, mv, index);
                index += 1;
            }
        }
        best
    }

    fn macroblock(&self, x: u32, y: u32, top: Option<MotionVector>) -> MbResult {
        let (bx, by) = ((x * MB_SIZE) as i32, (y * MB_SIZE) as i32);
        let hint = predictor_hint(self.pred, self.pred_mb_width, x, y).scaled_up();

        // Starting point: best of hint, top neighbour and zero.
        let mut start = Best::NONE;
        let candidates = [Some(hint), top, Some(MotionVector::ZERO)];
        for (index, cand) in candidates.iter().enumerate() {
            let Some(c) = cand else { continue };
            let (px, py) = (clamp_int(int_of(c.x as i32)), clamp_int(int_of(c.y as i32)));
            let mv = qpel(px, py);
            let cost = self.region_cost(bx, by, MASK_ALL, mv) + self.rate(mv, hint);
            start.offer(cost, mv, index as u32);
        }
        let (sx, sy) = (start.mv.x as i32 / 4, start.mv.y as i32 / 4);

        // Integer search, nine regions tracked at once.
        let mut trackers = [Best::NONE; TRACKERS.len()];
        for (index, dx, dy) in window(self.range) {
            let mv = qpel(sx + dx, sy + dy);
            let rate = self.rate(mv, hint);
            let d = self.block_costs(bx, by, mv);
            for (t, &mask) in trackers.iter_mut().zip(TRACKERS.iter()) {
                let dist: u32 = (0..SUBBLOCKS_PER_MB)
                    .filter(|s| mask & (1 << s) != 0)
                    .map(|s| d[s])
                    .sum();
                t.offer(dist + rate, mv, index);
            }
        }

        // Partition decision.
        let l = self.lambda;
        let shape_costs = [
            trackers[0].cost,
            trackers[5].cost + trackers[6].cost + 2 * l,
            trackers[7].cost + trackers[8].cost + 2 * l,
            trackers[1].cost + trackers[2].cost + trackers[3].cost + trackers[4].cost + 4 * l,
        ];
        let mut shape_code = 0usize;
        for (code, &c) in shape_costs.iter().enumerate() {
            if c < shape_costs[shape_code] {
                shape_code = code;
            }
        }
        let (shape, parts): (ShapeCode, &[usize]) = match shape_code {
            0 => (ShapeCode::Shape16x16, &[0]),
            1 => (ShapeCode::Shape16x8, &[5, 6]),
            2 => (ShapeCode::Shape8x16, &[7, 8]),
            _ => (ShapeCode::Shape8x8, &[1, 2, 3, 4]),
        };

        let mut mvs = [MotionVector::ZERO; SUBBLOCKS_PER_MB];
        for &t in parts {
            let mask = TRACKERS[t];
            let mut best = trackers[t];
            if self.subpel & 1 != 0 {
                best = self.subpel_step(bx, by, mask, best, hint, 2);
            }
            if self.subpel & 2 != 0 {
                best = self.subpel_step(bx, by, mask, best, hint, 1);
            }
            for (s, mv) in mvs.iter_mut().enumerate() {
                if mask & (1 << s) != 0 {
                    *mv = best.mv;
                }
            }
        }

        let mut residuals = [0u16; SUBBLOCKS_PER_MB];
        for (s, r) in residuals.iter_mut().enumerate() {
            let x = bx + (s as i32 % 4) * 4;
            let y = by + (s as i32 / 4) * 4;
            let d = block_distortion(self.cur, self.refp, x, y, mvs[s], self.sad_adjust);
            *r = d.min(u16::MAX as u32) as u16;
        }

        MbResult { mvs, residuals, shape }
    }
}

fn store(result: &MbResult, mb: usize, mvs: &mut [u32], residuals: &mut [u32], shapes: &mut [u32]) {
    for (s, mv) in result.mvs.iter().enumerate() {
        mvs[mb * SUBBLOCKS_PER_MB + s] = mv.pack();
    }
    for pair in 0..SUBBLOCKS_PER_MB / 2 {
        let lo = result.residuals[2 * pair] as u32;
        let hi = result.residuals[2 * pair + 1] as u32;
        residuals[mb * SUBBLOCKS_PER_MB / 2 + pair] = lo | (hi << 16);
    }
    shapes[mb] = result.shape as u32;
}

fn check_outputs(
    kernel: &'static str,
    params: &KernelParams,
    mvs: &[u32],
    residuals: &[u32],
    shapes: &[u32],
) -> Result<usize, BackendError> {
    let mb_count = (params.mb_width * params.mb_height) as usize;
    check_len(kernel, "mvs", mvs.len(), mb_count * SUBBLOCKS_PER_MB)?;
    check_len(kernel, "residuals", residuals.len(), mb_count * SUBBLOCKS_PER_MB / 2)?;
    check_len(kernel, "shapes", shapes.len(), mb_count)?;
    Ok(mb_count)
}

/// Full-resolution refinement, one macroblock column per work group.
#[allow(clippy::too_many_arguments)]
pub(crate) fn refine(
    params: &KernelParams,
    groups: [u32; 2],
    src: &Image<u8>,
    refr: &Image<u8>,
    pred: &[u32],
    mvs: &mut [u32],
    residuals: &mut [u32],
    shapes: &mut [u32],
) -> Result<(), BackendError> {
    check_outputs("refine", params, mvs, residuals, shapes)?;
    let ctx = RefineCtx::new(params, src, refr, pred);
    let mb_w = params.mb_width;
    let rows = params.iterations.min(params.mb_height);

    for x in 0..groups[0].min(mb_w) {
        let mut top = None;
        for y in 0..rows {
            let r = ctx.macroblock(x, y, top);
            store(&r, (y * mb_w + x) as usize, mvs, residuals, shapes);
            top = Some(r.bottom_left());
        }
    }
    Ok(())
}

/// Wavefront refinement: `groups[0]` threads, row-interleaved, each
/// macroblock gated on the scoreboard entry of its top-right neighbour.
#[allow(clippy::too_many_arguments)]
pub(crate) fn refine_wpp(
    params: &KernelParams,
    groups: [u32; 2],
    src: &Image<u8>,
    refr: &Image<u8>,
    pred: &[u32],
    mvs: &mut [u32],
    residuals: &mut [u32],
    shapes: &mut [u32],
    scoreboard: &mut [u32],
) -> Result<(), BackendError> {
    let mb_count = check_outputs("refine_wpp", params, mvs, residuals, shapes)?;
    let (mb_w, mb_h) = (params.mb_width, params.mb_height);
    check_len("refine_wpp", "scoreboard", scoreboard.len(), 2 * mb_w as usize)?;
    if mb_w == 0 || mb_h == 0 {
        return Ok(());
    }

    let ctx = RefineCtx::new(params, src, refr, pred);
    let board: Vec<AtomicU32> = scoreboard[..2 * mb_w as usize].iter().map(|&v| AtomicU32::new(v)).collect();
    let finished = run_wavefront(mb_w, mb_h, groups[0].max(1), &board, |x, y, top| {
        let r = ctx.macroblock(x, y, top);
        let bottom_left = r.bottom_left();
        (r, bottom_left)
    });
    for (dst, src) in scoreboard.iter_mut().zip(&board) {
        *dst = src.load(Ordering::Acquire);
    }

    let finished = finished?;
    for (mb, r) in &finished {
        store(r, *mb, mvs, residuals, shapes);
    }
    if finished.len() != mb_count {
        return Err(BackendError::Execution(format!(
            "refine_wpp completed {} of {mb_count} macroblocks",
            finished.len()
        )));
    }
    Ok(())
}

/// Raises the shared abort flag if the worker holding it unwinds, so the
/// workers gated on its rows stop waiting.
struct AbortOnUnwind<'a>(&'a AtomicBool);

impl Drop for AbortOnUnwind<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.0.store(true, Ordering::Release);
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

/// Visit every macroblock in wavefront order on `threads` threads. Thread
/// `t` owns rows `t, t + threads, …`; macroblock `(x, y)` waits until
/// `board[min(x + 1, mb_w - 1)] >= y`. `work` gets the bottom-left vector
/// published by the macroblock above and returns its result together with
/// the vector to publish for the row below.
///
/// `board` is `2 * mb_w` words: completion counters, then one published
/// vector per column. A column's vector slot is written before its counter
/// and is not overwritten until the row below has read it, since the row
/// two below waits on that row passing column `x + 1`.
///
/// A panicking worker fails the whole call with `Execution`; the others
/// notice through the abort flag instead of spinning forever.
fn run_wavefront<T, F>(
    mb_w: u32,
    mb_h: u32,
    threads: u32,
    board: &[AtomicU32],
    work: F,
) -> Result<Vec<(usize, T)>, BackendError>
where
    T: Send,
    F: Fn(u32, u32, Option<MotionVector>) -> (T, MotionVector) + Sync,
{
    check_len("refine_wpp", "scoreboard", board.len(), 2 * mb_w as usize)?;
    let mb_count = (mb_w * mb_h) as usize;
    let (counters, published) = board.split_at(mb_w as usize);
    let abort = AtomicBool::new(false);

    let joined: Vec<std::thread::Result<Option<Vec<(usize, T)>>>> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..threads)
            .map(|t| {
                let (abort, work) = (&abort, &work);
                scope.spawn(move || {
                    let _guard = AbortOnUnwind(abort);
                    let mut done = Vec::new();
                    let mut y = t;
                    while y < mb_h {
                        for x in 0..mb_w {
                            if y > 0 {
                                let gate = &counters[(x + 1).min(mb_w - 1) as usize];
                                while gate.load(Ordering::Acquire) < y {
                                    if abort.load(Ordering::Acquire) {
                                        return None;
                                    }
                                    std::hint::spin_loop();
                                    std::thread::yield_now();
                                }
                            }
                            let top = (y > 0)
                                .then(|| MotionVector::unpack(published[x as usize].load(Ordering::Acquire)));
                            let (r, bottom_left) = work(x, y, top);
                            published[x as usize].store(bottom_left.pack(), Ordering::Release);
                            counters[x as usize].store(y + 1, Ordering::Release);
                            let mb = (y * mb_w + x) as usize;
                            done.push((mb, r));
                        }
                        y += threads;
                    }
                    Some(done)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join()).collect()
    });

    let mut finished = Vec::with_capacity(mb_count);
    let mut aborted = false;
    for worker in joined {
        match worker {
            Ok(Some(done)) => finished.extend(done),
            Ok(None) => aborted = true,
            Err(payload) => {
                return Err(BackendError::Execution(format!(
                    "refine_wpp worker panicked: {}",
                    panic_message(payload.as_ref())
                )));
            }
        }
    }
    if aborted {
        return Err(BackendError::Execution("refine_wpp aborted".into()));
    }
    Ok(finished)
}
