// image.rs — Runtime-sized image plane, generic over pixel type.
//
// One `Image<T>` is one plane of a frame (luma or a chroma plane) or one
// pyramid level held by the host reference backend. Rows may carry padding:
// `stride` is the pitch in *elements* and is always ≥ `width`.
//
// Memory layout (stride = 5, width = 4):
//
//   data index:  0  1  2  3 [4]  5  6  7  8 [9] 10 11 12 13 [14]
//   pixel:       ■  ■  ■  ■  ·   ■  ■  ■  ■  ·   ■  ■  ■  ■  ·
//   row:         |--- row 0 ---|  |--- row 1 ---|  |--- row 2 ---|
//
// Reads used by the motion-search kernels go through `get_clamped`, which
// replicates the border pixel for coordinates outside the plane. The
// device kernels sample the same way (clamp-to-edge), so host and device
// agree on every block that straddles the frame edge.

use std::fmt;

/// Trait for types that can serve as pixel values in an Image.
pub trait Pixel: Copy + Default + Send + Sync + PartialOrd + 'static {
    /// Widen to u32 for distortion arithmetic.
    fn to_u32(self) -> u32;

    /// Narrow from u32, saturating at the type's maximum.
    fn from_u32(v: u32) -> Self;
}

impl Pixel for u8 {
    #[inline]
    fn to_u32(self) -> u32 {
        self as u32
    }

    #[inline]
    fn from_u32(v: u32) -> Self {
        v.min(u8::MAX as u32) as u8
    }
}

impl Pixel for u16 {
    #[inline]
    fn to_u32(self) -> u32 {
        self as u32
    }

    #[inline]
    fn from_u32(v: u32) -> Self {
        v.min(u16::MAX as u32) as u16
    }
}

/// A 2D image with runtime dimensions, generic over pixel type `T`.
pub struct Image<T: Pixel> {
    /// Pixel data in row-major order. Length = height * stride.
    data: Vec<T>,
    width: usize,
    height: usize,
    /// Row stride in *elements* (not bytes). stride >= width.
    stride: usize,
}

// Manual Clone: a deep copy of the pixel buffer, never implicit in the
// pipeline (ping-pong slots swap handles instead).
impl<T: Pixel> Clone for Image<T> {
    fn clone(&self) -> Self {
        Image {
            data: self.data.clone(),
            width: self.width,
            height: self.height,
            stride: self.stride,
        }
    }
}

impl<T: Pixel> PartialEq for Image<T> {
    /// Two images are equal when their visible pixels match; stride padding
    /// is ignored.
    fn eq(&self, other: &Self) -> bool {
        self.width == other.width
            && self.height == other.height
            && (0..self.height).all(|y| self.row(y) == other.row(y))
    }
}

impl<T: Pixel> Image<T> {
    /// Create a zero-initialized image with stride == width.
    pub fn new(width: usize, height: usize) -> Self {
        Self::new_with_stride(width, height, width)
    }

    /// Create a zero-initialized image with an explicit stride.
    ///
    /// # Panics
    /// Panics if `stride < width`.
    pub fn new_with_stride(width: usize, height: usize, stride: usize) -> Self {
        assert!(
            stride >= width,
            "stride ({stride}) must be >= width ({width})"
        );
        Image {
            data: vec![T::default(); height * stride],
            width,
            height,
            stride,
        }
    }

    /// Create an image filled with a single value.
    pub fn filled(width: usize, height: usize, value: T) -> Self {
        Image {
            data: vec![value; width * height],
            width,
            height,
            stride: width,
        }
    }

    /// Create an image from an existing pixel vector (no stride padding).
    ///
    /// # Panics
    /// Panics if `data.len() != width * height`.
    pub fn from_vec(width: usize, height: usize, data: Vec<T>) -> Self {
        assert_eq!(
            data.len(),
            width * height,
            "data length ({}) must equal width * height ({})",
            data.len(),
            width * height,
        );
        Image {
            data,
            width,
            height,
            stride: width,
        }
    }

    /// Create an image from raw data with explicit stride.
    ///
    /// # Panics
    /// Panics if `data.len() != height * stride` or `stride < width`.
    pub fn from_vec_with_stride(
        width: usize,
        height: usize,
        stride: usize,
        data: Vec<T>,
    ) -> Self {
        assert!(stride >= width, "stride ({stride}) must be >= width ({width})");
        assert_eq!(
            data.len(),
            height * stride,
            "data length ({}) must equal height * stride ({})",
            data.len(),
            height * stride,
        );
        Image {
            data,
            width,
            height,
            stride,
        }
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.height
    }

    #[inline]
    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Get the pixel value at (x, y).
    ///
    /// # Panics
    /// Panics if (x, y) is out of bounds.
    #[inline]
    pub fn get(&self, x: usize, y: usize) -> T {
        self.bounds_check(x, y);
        self.data[y * self.stride + x]
    }

    /// Get the pixel at (x, y) with both coordinates clamped into the
    /// image (border replication). An empty image yields `T::default()`.
    #[inline]
    pub fn get_clamped(&self, x: i32, y: i32) -> T {
        if self.width == 0 || self.height == 0 {
            return T::default();
        }
        let cx = x.clamp(0, self.width as i32 - 1) as usize;
        let cy = y.clamp(0, self.height as i32 - 1) as usize;
        self.data[cy * self.stride + cx]
    }

    #[inline]
    pub fn get_mut(&mut self, x: usize, y: usize) -> &mut T {
        self.bounds_check(x, y);
        let idx = y * self.stride + x;
        &mut self.data[idx]
    }

    #[inline]
    pub fn set(&mut self, x: usize, y: usize, value: T) {
        *self.get_mut(x, y) = value;
    }

    /// Borrow a single row (visible pixels only, no padding).
    #[inline]
    pub fn row(&self, y: usize) -> &[T] {
        assert!(y < self.height, "row {y} out of bounds (height {})", self.height);
        let start = y * self.stride;
        &self.data[start..start + self.width]
    }

    #[inline]
    pub fn row_mut(&mut self, y: usize) -> &mut [T] {
        assert!(y < self.height, "row {y} out of bounds (height {})", self.height);
        let start = y * self.stride;
        &mut self.data[start..start + self.width]
    }

    /// Overwrite every visible pixel with `value`.
    pub fn fill(&mut self, value: T) {
        for y in 0..self.height {
            self.row_mut(y).fill(value);
        }
    }

    /// Copy the visible pixels of `src` into this image.
    ///
    /// # Panics
    /// Panics if the dimensions differ.
    pub fn copy_from(&mut self, src: &Image<T>) {
        assert!(
            self.width == src.width && self.height == src.height,
            "copy_from: {}×{} into {}×{}",
            src.width, src.height, self.width, self.height,
        );
        for y in 0..self.height {
            self.row_mut(y).copy_from_slice(src.row(y));
        }
    }

    /// Extract every other row starting at `first_row` (0 = even lines,
    /// 1 = odd lines). The result has `height / 2` rows.
    pub fn field(&self, first_row: usize) -> Image<T> {
        debug_assert!(first_row < 2);
        let field_height = self.height / 2;
        let mut out = Image::new(self.width, field_height);
        for y in 0..field_height {
            out.row_mut(y).copy_from_slice(self.row(2 * y + first_row));
        }
        out
    }

    /// Iterate over all pixels as `(x, y, value)` tuples, skipping padding.
    pub fn pixels(&self) -> impl Iterator<Item = (usize, usize, T)> + '_ {
        (0..self.height).flat_map(move |y| {
            (0..self.width).map(move |x| (x, y, self.data[y * self.stride + x]))
        })
    }

    /// The underlying buffer, including stride padding.
    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data
    }

    #[inline]
    fn bounds_check(&self, x: usize, y: usize) {
        assert!(
            x < self.width && y < self.height,
            "pixel ({x},{y}) out of bounds for image {}×{}",
            self.width,
            self.height,
        );
    }
}

// Debug formatting — useful for small images in tests.
impl<T: Pixel + fmt::Debug> fmt::Debug for Image<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Image<{}> {{ {}×{}, stride={} }}",
            std::any::type_name::<T>(),
            self.width,
            self.height,
            self.stride,
        )?;
        for y in 0..self.height.min(8) {
            write!(f, "  row {y}: [")?;
            for x in 0..self.width.min(16) {
                if x > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{:?}", self.get(x, y))?;
            }
            if self.width > 16 {
                write!(f, ", ...")?;
            }
            writeln!(f, "]")?;
        }
        if self.height > 8 {
            writeln!(f, "  ...")?;
        }
        Ok(())
    }
}

impl<T: Pixel> std::ops::Index<(usize, usize)> for Image<T> {
    type Output = T;

    #[inline]
    fn index(&self, (x, y): (usize, usize)) -> &T {
        self.bounds_check(x, y);
        &self.data[y * self.stride + x]
    }
}

impl<T: Pixel> std::ops::IndexMut<(usize, usize)> for Image<T> {
    #[inline]
    fn index_mut(&mut self, (x, y): (usize, usize)) -> &mut T {
        self.bounds_check(x, y);
        let idx = y * self.stride + x;
        &mut self.data[idx]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_u8() {
        let img: Image<u8> = Image::new(4, 3);
        assert_eq!(img.width(), 4);
        assert_eq!(img.height(), 3);
        assert_eq!(img.stride(), 4);
        assert!(img.as_slice().iter().all(|&v| v == 0));
    }

    #[test]
    fn test_stride_padding() {
        let mut img: Image<u8> = Image::new_with_stride(3, 2, 8);
        img.set(2, 1, 9);
        assert_eq!(img.as_slice().len(), 16);
        assert_eq!(img.as_slice()[8 + 2], 9);
        assert_eq!(img.row(1), &[0, 0, 9]);
    }

    #[test]
    fn test_get_clamped_replicates_border() {
        let img = Image::from_vec(3, 2, vec![1u8, 2, 3, 4, 5, 6]);
        assert_eq!(img.get_clamped(-5, -5), 1);
        assert_eq!(img.get_clamped(10, 0), 3);
        assert_eq!(img.get_clamped(1, 7), 5);
        assert_eq!(img.get_clamped(1, 1), 5);
    }

    #[test]
    fn test_get_clamped_empty() {
        let img: Image<u8> = Image::new(0, 0);
        assert_eq!(img.get_clamped(0, 0), 0);
    }

    #[test]
    fn test_field_extraction() {
        // Rows hold their own index so the parity is easy to read.
        let mut img: Image<u8> = Image::new(2, 6);
        for y in 0..6 {
            img.row_mut(y).fill(y as u8);
        }
        let top = img.field(0);
        let bottom = img.field(1);
        assert_eq!(top.height(), 3);
        assert_eq!(bottom.height(), 3);
        assert_eq!(top.row(2), &[4, 4]);
        assert_eq!(bottom.row(0), &[1, 1]);
        assert_eq!(bottom.row(2), &[5, 5]);
    }

    #[test]
    fn test_eq_ignores_padding() {
        let a = Image::from_vec_with_stride(2, 1, 4, vec![1u8, 2, 7, 7]);
        let b = Image::from_vec(2, 1, vec![1u8, 2]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_copy_from_and_fill() {
        let src = Image::filled(3, 3, 42u8);
        let mut dst: Image<u8> = Image::new_with_stride(3, 3, 5);
        dst.copy_from(&src);
        assert_eq!(dst, src);
        dst.fill(7);
        assert!(dst.pixels().all(|(_, _, v)| v == 7));
    }

    #[test]
    fn test_pixel_saturation() {
        assert_eq!(u8::from_u32(300), 255);
        assert_eq!(u16::from_u32(70_000), u16::MAX);
        assert_eq!(u16::from_u32(4080), 4080);
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn test_get_out_of_bounds() {
        let img: Image<u8> = Image::new(2, 2);
        img.get(2, 0);
    }

    #[test]
    fn test_index_read_write() {
        let mut img: Image<u8> = Image::new(4, 4);
        img[(1, 2)] = 200;
        assert_eq!(img[(1, 2)], 200);
        assert_eq!(img.get(1, 2), 200);
    }
}
