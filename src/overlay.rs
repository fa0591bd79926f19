// overlay.rs — draw motion vectors into output frames, and dump them as text.
//
// One line per partition, from the partition centre to centre + mv (in
// whole pixels, quarter-pel rounded toward zero), drawn white into the luma
// plane. Zero vectors are not drawn, so a static scene passes through the
// overlay untouched.
//
// For a field, the line is rasterised in field coordinates and each point
// is written to frame row 2·y + polarity, i.e. the field's own lines.

use std::io::Write;

use crate::frame::{Frame, Polarity};
use crate::mv::{FrameResults, MotionVector, ShapeCode};

/// Luma value of overlaid vectors.
pub const OVERLAY_LUMA: u8 = 255;

/// Partitions of a macroblock as (centre_x, centre_y, representative
/// sub-block), in pixels relative to the macroblock origin.
pub fn partition_centres(shape: ShapeCode) -> &'static [(i32, i32, usize)] {
    match shape {
        ShapeCode::Shape16x16 => &[(8, 8, 0)],
        ShapeCode::Shape16x8 => &[(8, 4, 0), (8, 12, 8)],
        ShapeCode::Shape8x16 => &[(4, 8, 0), (12, 8, 2)],
        ShapeCode::Shape8x8 => &[(4, 4, 0), (12, 4, 2), (4, 12, 8), (12, 12, 10)],
    }
}

/// Bresenham from (x0, y0) to (x1, y1), clipped to `w × h`.
fn draw_line(mut plot: impl FnMut(i32, i32), w: i32, h: i32, x0: i32, y0: i32, x1: i32, y1: i32) {
    let (mut x, mut y) = (x0, y0);
    let dx = (x1 - x0).abs();
    let dy = -(y1 - y0).abs();
    let sx = if x0 < x1 { 1 } else { -1 };
    let sy = if y0 < y1 { 1 } else { -1 };
    let mut err = dx + dy;

    loop {
        if x >= 0 && y >= 0 && x < w && y < h {
            plot(x, y);
        }
        if x == x1 && y == y1 {
            break;
        }
        let e2 = 2 * err;
        if e2 >= dy {
            err += dy;
            x += sx;
        }
        if e2 <= dx {
            err += dx;
            y += sy;
        }
    }
}

/// Draw every non-zero partition vector of `results` into `frame`.
///
/// `field` selects which lines of `frame` the results describe; `None`
/// means the results cover the whole frame. Returns the number of vectors
/// drawn.
pub fn draw_motion_vectors(frame: &mut Frame, results: &FrameResults, field: Option<Polarity>) -> usize {
    let grid = results.mvs.grid;
    let width = frame.width() as i32;
    // Picture row y lives on frame row y * step + first.
    let (pic_h, step, first) = match field {
        None => (frame.height() as i32, 1, 0),
        Some(p) => (frame.height() as i32 / 2, 2, p.index() as i32),
    };
    let luma = frame.luma_mut();
    let mut drawn = 0;

    for mb_y in 0..grid.mb_height {
        for mb_x in 0..grid.mb_width {
            let shape = results.shapes.get(mb_x, mb_y);
            for &(cx, cy, sub) in partition_centres(shape) {
                let mv: MotionVector = results.mvs.get(mb_x, mb_y, sub);
                if mv.is_zero() {
                    continue;
                }
                let x0 = (mb_x * 16) as i32 + cx;
                let y0 = (mb_y * 16) as i32 + cy;
                let x1 = x0 + mv.x as i32 / 4;
                let y1 = y0 + mv.y as i32 / 4;
                draw_line(
                    |x, y| luma.set(x as usize, (y * step + first) as usize, OVERLAY_LUMA),
                    width,
                    pic_h,
                    x0,
                    y0,
                    x1,
                    y1,
                );
                drawn += 1;
            }
        }
    }
    drawn
}

/// Write one line per macroblock:
///
/// `frame <n> <field> mb <x> <y> shape <code> mvs <x,y> ×16`
pub fn dump_motion_vectors<W: Write>(
    out: &mut W,
    frame_index: usize,
    field: Option<Polarity>,
    results: &FrameResults,
) -> std::io::Result<()> {
    let grid = results.mvs.grid;
    let tag = match field {
        None => "frame",
        Some(Polarity::Top) => "top",
        Some(Polarity::Bottom) => "bottom",
    };
    for mb_y in 0..grid.mb_height {
        for mb_x in 0..grid.mb_width {
            write!(
                out,
                "frame {frame_index} {tag} mb {mb_x} {mb_y} shape {}",
                results.shapes.get(mb_x, mb_y) as u8
            )?;
            write!(out, " mvs")?;
            for sub in 0..16 {
                let mv = results.mvs.get(mb_x, mb_y, sub);
                write!(out, " {},{}", mv.x, mv.y)?;
            }
            writeln!(out)?;
        }
    }
    Ok(())
}
