// frame.rs — planar I420 frames and the source/sink collaborators.
//
// The pipeline borrows one `Frame` per iteration. Where the pixels come from
// (a raw .yuv file, a synthetic pattern) and where they go is behind the
// `FrameSource` / `FrameSink` traits, so the driver is testable without
// touching the filesystem.
//
// I420 LAYOUT
// ───────────
//   Y  width   × height      stride = align16(width)
//   U  width/2 × height/2    stride = align16(width/2)
//   V  width/2 × height/2    stride = align16(width/2)
//
// On disk the planes are tightly packed, Y then U then V, one frame after
// another with no header. Width and height must be even.
//
// FIELDS
// ──────
// An interlaced frame carries two fields on alternating lines: the top
// field on even lines, the bottom field on odd lines. `FieldSelect::Field`
// asks a source for one of them as a half-height frame (chroma lines are
// split the same way, so the height must be divisible by 4).

use std::fs::File;
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::align::align16;
use crate::error::FrameError;
use crate::image::Image;

// ---------------------------------------------------------------------------
// Field selection
// ---------------------------------------------------------------------------

/// Which field of an interlaced frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Polarity {
    /// Even lines.
    Top,
    /// Odd lines.
    Bottom,
}

impl Polarity {
    pub const BOTH: [Polarity; 2] = [Polarity::Top, Polarity::Bottom];

    /// 0 for top, 1 for bottom: the first frame line of the field.
    pub fn index(self) -> u32 {
        match self {
            Polarity::Top => 0,
            Polarity::Bottom => 1,
        }
    }
}

/// What `FrameSource::get_sample` should deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FieldSelect {
    #[default]
    Frame,
    Field(Polarity),
}

// ---------------------------------------------------------------------------
// Frame
// ---------------------------------------------------------------------------

/// Bytes of one tightly-packed I420 frame.
pub fn i420_frame_size(width: u32, height: u32) -> usize {
    let (w, h) = (width as usize, height as usize);
    w * h + 2 * (w / 2) * (h / 2)
}

/// A planar 8-bit 4:2:0 picture.
#[derive(Clone, PartialEq)]
pub struct Frame {
    y: Image<u8>,
    u: Image<u8>,
    v: Image<u8>,
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Frame {{ {}×{} I420 }}", self.width(), self.height())
    }
}

impl Frame {
    /// Black (Y=0, U=V=128) frame.
    pub fn new(width: u32, height: u32) -> Self {
        let (w, h) = (width as usize, height as usize);
        let (cw, ch) = (w / 2, h / 2);
        let mut u = Image::new_with_stride(cw, ch, align16(cw as u32) as usize);
        let mut v = Image::new_with_stride(cw, ch, align16(cw as u32) as usize);
        u.fill(128);
        v.fill(128);
        Frame {
            y: Image::new_with_stride(w, h, align16(width) as usize),
            u,
            v,
        }
    }

    /// Frame with the given luma and neutral chroma.
    pub fn from_luma(luma: &Image<u8>) -> Self {
        let mut f = Frame::new(luma.width() as u32, luma.height() as u32);
        f.y.copy_from(luma);
        f
    }

    pub fn width(&self) -> u32 {
        self.y.width() as u32
    }

    pub fn height(&self) -> u32 {
        self.y.height() as u32
    }

    pub fn luma(&self) -> &Image<u8> {
        &self.y
    }

    pub fn luma_mut(&mut self) -> &mut Image<u8> {
        &mut self.y
    }

    /// Planes in file order (Y, U, V).
    pub fn planes(&self) -> [&Image<u8>; 3] {
        [&self.y, &self.u, &self.v]
    }

    fn planes_mut(&mut self) -> [&mut Image<u8>; 3] {
        [&mut self.y, &mut self.u, &mut self.v]
    }

    /// Luma rows without stride padding, ready for `write_image`.
    pub fn luma_packed(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.y.width() * self.y.height());
        for row in 0..self.y.height() {
            out.extend_from_slice(self.y.row(row));
        }
        out
    }

    /// Fill from tightly-packed I420 bytes.
    pub fn read_i420(&mut self, bytes: &[u8]) -> Result<(), FrameError> {
        let need = i420_frame_size(self.width(), self.height());
        if bytes.len() < need {
            return Err(FrameError::ShortRead { expected: need, actual: bytes.len() });
        }
        let mut off = 0;
        for plane in self.planes_mut() {
            let w = plane.width();
            for row in 0..plane.height() {
                plane.row_mut(row).copy_from_slice(&bytes[off..off + w]);
                off += w;
            }
        }
        Ok(())
    }

    /// Append the tightly-packed I420 representation to `out`.
    pub fn write_i420(&self, out: &mut Vec<u8>) {
        for plane in self.planes() {
            for row in 0..plane.height() {
                out.extend_from_slice(plane.row(row));
            }
        }
    }

    /// One field as a half-height frame.
    pub fn field(&self, polarity: Polarity) -> Frame {
        let first = polarity.index() as usize;
        let mut f = Frame::new(self.width(), self.height() / 2);
        for (dst, src) in f.planes_mut().into_iter().zip(self.planes()) {
            dst.copy_from(&src.field(first));
        }
        f
    }

    /// Interleave two half-height fields back into one frame. Inverse of
    /// `field`.
    pub fn weave(top: &Frame, bottom: &Frame) -> Result<Frame, FrameError> {
        bottom.check_size(top.width(), top.height())?;
        let mut f = Frame::new(top.width(), top.height() * 2);
        for (i, dst) in f.planes_mut().into_iter().enumerate() {
            for y in 0..dst.height() {
                let src = if y % 2 == 0 { top.planes()[i] } else { bottom.planes()[i] };
                dst.row_mut(y).copy_from_slice(src.row(y / 2));
            }
        }
        Ok(f)
    }

    /// Resize in place when the dimensions differ. Contents are reset.
    pub fn ensure_size(&mut self, width: u32, height: u32) {
        if self.width() != width || self.height() != height {
            *self = Frame::new(width, height);
        }
    }

    fn check_size(&self, width: u32, height: u32) -> Result<(), FrameError> {
        if self.width() != width || self.height() != height {
            return Err(FrameError::SizeMismatch {
                expected_w: width as usize,
                expected_h: height as usize,
                actual_w: self.width() as usize,
                actual_h: self.height() as usize,
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Supplies input frames by index.
///
/// `Send` so the driver can prefetch the next frame on a scoped thread.
pub trait FrameSource: Send {
    /// Frames available.
    fn frame_count(&self) -> usize;

    /// Fill `frame` with frame `index`, or one of its fields. `frame` is
    /// resized as needed.
    fn get_sample(&mut self, index: usize, frame: &mut Frame, select: FieldSelect) -> Result<(), FrameError>;
}

/// Collects output frames and writes them out at the end of the run.
pub trait FrameSink {
    fn append_frame(&mut self, frame: &Frame) -> Result<(), FrameError>;

    fn write_to_file(&mut self, path: &Path) -> Result<(), FrameError>;
}

fn select_into(full: &Frame, frame: &mut Frame, select: FieldSelect) {
    match select {
        FieldSelect::Frame => frame.clone_from(full),
        FieldSelect::Field(p) => *frame = full.field(p),
    }
}

// ---------------------------------------------------------------------------
// Raw .yuv file source
// ---------------------------------------------------------------------------

/// Reads headerless I420 frames from a file, one seek + read per sample.
pub struct YuvFileSource {
    path: PathBuf,
    file: File,
    frame_count: usize,
    scratch: Vec<u8>,
    full: Frame,
}

impl YuvFileSource {
    pub fn open(path: impl AsRef<Path>, width: u32, height: u32) -> Result<Self, FrameError> {
        let path = path.as_ref().to_path_buf();
        let io = |source| FrameError::Io { path: path.clone(), source };
        let file = File::open(&path).map_err(io)?;
        let len = file.metadata().map_err(io)?.len() as usize;
        let frame_size = i420_frame_size(width, height);
        let frame_count = if frame_size == 0 { 0 } else { len / frame_size };
        info!(path = %path.display(), width, height, frame_count, "opened yuv input");
        Ok(YuvFileSource {
            path,
            file,
            frame_count,
            scratch: vec![0; frame_size],
            full: Frame::new(width, height),
        })
    }
}

impl FrameSource for YuvFileSource {
    fn frame_count(&self) -> usize {
        self.frame_count
    }

    fn get_sample(&mut self, index: usize, frame: &mut Frame, select: FieldSelect) -> Result<(), FrameError> {
        if index >= self.frame_count {
            return Err(FrameError::OutOfRange { index, count: self.frame_count });
        }
        let io = |source| FrameError::Io { path: self.path.clone(), source };
        let offset = (index * self.scratch.len()) as u64;
        self.file.seek(SeekFrom::Start(offset)).map_err(io)?;
        self.file.read_exact(&mut self.scratch).map_err(io)?;
        self.full.read_i420(&self.scratch)?;
        select_into(&self.full, frame, select);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Raw .yuv file sink
// ---------------------------------------------------------------------------

/// Buffers appended frames in memory; `write_to_file` writes them as
/// headerless I420.
#[derive(Debug, Default)]
pub struct YuvFileSink {
    frames: Vec<Frame>,
}

impl YuvFileSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }
}

impl FrameSink for YuvFileSink {
    fn append_frame(&mut self, frame: &Frame) -> Result<(), FrameError> {
        if let Some(first) = self.frames.first() {
            frame.check_size(first.width(), first.height())?;
        }
        self.frames.push(frame.clone());
        Ok(())
    }

    fn write_to_file(&mut self, path: &Path) -> Result<(), FrameError> {
        let io = |source| FrameError::Io { path: path.to_path_buf(), source };
        let mut out = BufWriter::new(File::create(path).map_err(io)?);
        let mut bytes = Vec::new();
        for f in &self.frames {
            bytes.clear();
            f.write_i420(&mut bytes);
            out.write_all(&bytes).map_err(io)?;
        }
        out.flush().map_err(io)?;
        debug!(path = %path.display(), frames = self.frames.len(), "wrote yuv output");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Synthetic source
// ---------------------------------------------------------------------------

/// Test patterns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pattern {
    /// Every luma sample equals the value.
    Constant(u8),
    /// Hashed texture panning by `(dx, dy)` pixels per frame.
    Moving { dx: i32, dy: i32 },
    /// Smooth gradient panning by `(dx, dy)` pixels per frame.
    Gradient { dx: i32, dy: i32 },
    /// Like `Moving`, but the bottom field is captured half a frame later
    /// than the top field, as an interlaced camera would.
    Interlaced { dx: i32, dy: i32 },
}

fn texel(x: i32, y: i32) -> u8 {
    let mut v = (x as u32).wrapping_mul(73_856_093) ^ (y as u32).wrapping_mul(19_349_663);
    v ^= v >> 13;
    v = v.wrapping_mul(0x5bd1_e995);
    v ^= v >> 15;
    (v >> 24) as u8
}

/// Generates frames on demand from a `Pattern`.
#[derive(Debug, Clone)]
pub struct SyntheticSource {
    width: u32,
    height: u32,
    frames: usize,
    pattern: Pattern,
}

impl SyntheticSource {
    pub fn new(width: u32, height: u32, frames: usize, pattern: Pattern) -> Self {
        SyntheticSource { width, height, frames, pattern }
    }

    fn luma_at(&self, index: usize, x: i32, y: i32) -> u8 {
        let t = index as i32;
        match self.pattern {
            Pattern::Constant(v) => v,
            Pattern::Moving { dx, dy } => texel(x + dx * t, y + dy * t),
            Pattern::Gradient { dx, dy } => {
                let (sx, sy) = (x + dx * t, y + dy * t);
                (sx.wrapping_mul(3) + sy.wrapping_mul(5)).rem_euclid(256) as u8
            }
            Pattern::Interlaced { dx, dy } => {
                // Bottom-field lines sample the scene half a frame later.
                let half = y & 1;
                texel(x + dx * t + half * dx / 2, y + dy * t + half * dy / 2)
            }
        }
    }

    /// The full frame at `index`, independent of any previous call.
    pub fn render(&self, index: usize) -> Frame {
        let mut f = Frame::new(self.width, self.height);
        let luma = f.luma_mut();
        for y in 0..self.height as usize {
            for (x, px) in luma.row_mut(y).iter_mut().enumerate() {
                *px = self.luma_at(index, x as i32, y as i32);
            }
        }
        f
    }
}

impl FrameSource for SyntheticSource {
    fn frame_count(&self) -> usize {
        self.frames
    }

    fn get_sample(&mut self, index: usize, frame: &mut Frame, select: FieldSelect) -> Result<(), FrameError> {
        if index >= self.frames {
            return Err(FrameError::OutOfRange { index, count: self.frames });
        }
        let full = self.render(index);
        select_into(&full, frame, select);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_i420_size() {
        assert_eq!(i420_frame_size(176, 144), 176 * 144 * 3 / 2);
        assert_eq!(i420_frame_size(2, 2), 6);
    }

    #[test]
    fn test_new_frame_is_black_with_neutral_chroma() {
        let f = Frame::new(8, 4);
        assert!(f.luma().pixels().all(|(_, _, v)| v == 0));
        assert!(f.planes()[1].pixels().all(|(_, _, v)| v == 128));
        assert_eq!(f.planes()[2].width(), 4);
        assert_eq!(f.luma().stride(), 16);
    }

    #[test]
    fn test_packed_round_trip_ignores_stride() {
        let bytes: Vec<u8> = (0..i420_frame_size(6, 4)).map(|i| i as u8).collect();
        let mut f = Frame::new(6, 4);
        f.read_i420(&bytes).unwrap();
        assert_eq!(f.luma().get(5, 0), 5);
        assert_eq!(f.luma().get(0, 1), 6);
        let mut out = Vec::new();
        f.write_i420(&mut out);
        assert_eq!(out, bytes);
        assert_eq!(f.luma_packed(), bytes[..24].to_vec());
    }

    #[test]
    fn test_read_short_buffer_fails() {
        let mut f = Frame::new(4, 4);
        assert!(f.read_i420(&[0; 10]).is_err());
    }

    #[test]
    fn test_field_takes_alternate_lines() {
        let mut f = Frame::new(4, 8);
        for y in 0..8 {
            f.luma_mut().row_mut(y).fill(y as u8);
        }
        let bottom = f.field(Polarity::Bottom);
        assert_eq!(bottom.height(), 4);
        assert_eq!(bottom.luma().get(0, 0), 1);
        assert_eq!(bottom.luma().get(0, 3), 7);
        assert_eq!(bottom.planes()[1].height(), 2);
    }

    #[test]
    fn test_weave_inverts_field() {
        let s = SyntheticSource::new(16, 16, 1, Pattern::Moving { dx: 0, dy: 0 });
        let full = s.render(0);
        let woven = Frame::weave(&full.field(Polarity::Top), &full.field(Polarity::Bottom)).unwrap();
        assert_eq!(woven, full);
    }

    #[test]
    fn test_synthetic_constant_and_range() {
        let mut s = SyntheticSource::new(16, 16, 2, Pattern::Constant(42));
        let mut f = Frame::new(16, 16);
        s.get_sample(1, &mut f, FieldSelect::Frame).unwrap();
        assert!(f.luma().pixels().all(|(_, _, v)| v == 42));
        assert!(matches!(
            s.get_sample(2, &mut f, FieldSelect::Frame),
            Err(FrameError::OutOfRange { index: 2, count: 2 })
        ));
    }

    #[test]
    fn test_synthetic_moving_shifts() {
        let s = SyntheticSource::new(32, 32, 2, Pattern::Moving { dx: 2, dy: 1 });
        let (f0, f1) = (s.render(0), s.render(1));
        // frame1(x, y) = frame0(x + 2, y + 1)
        assert_eq!(f1.luma().get(3, 4), f0.luma().get(5, 5));
    }

    #[test]
    fn test_synthetic_field_select() {
        let mut s = SyntheticSource::new(16, 16, 1, Pattern::Interlaced { dx: 2, dy: 0 });
        let mut field = Frame::new(16, 16);
        s.get_sample(0, &mut field, FieldSelect::Field(Polarity::Top)).unwrap();
        assert_eq!(field.height(), 8);
        assert_eq!(field, s.render(0).field(Polarity::Top));
    }
}
