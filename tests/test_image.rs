// tests/test_image.rs — Integration tests for Image<T> and the result fields
// decoded from device words.
//
// These run with `cargo test --test test_image`.
// Unlike unit tests (inside #[cfg(test)] mod tests {}), integration tests
// live in tests/ and can only access the crate's public API.

use pyramid_me::image::Image;
use pyramid_me::mv::{
    mv_view, MacroblockGrid, MotionVector, MotionVectorField, ResidualField, ShapeCode, ShapeField,
};

// ===== Image construction & access =====

#[test]
fn image_new_zero_initialized() {
    let img: Image<u8> = Image::new(100, 50);
    assert_eq!(img.width(), 100);
    assert_eq!(img.height(), 50);
    assert_eq!(img.get(0, 0), 0);
    assert_eq!(img.get(99, 49), 0);
}

#[test]
fn image_index_and_set_agree() {
    let mut img: Image<u8> = Image::new_with_stride(10, 10, 16);
    for y in 0..10 {
        for x in 0..10 {
            img[(x, y)] = ((x + y) % 2 * 255) as u8;
        }
    }
    for y in 0..10 {
        for x in 0..10 {
            assert_eq!(img.get(x, y), ((x + y) % 2 * 255) as u8, "mismatch at ({x}, {y})");
        }
    }
}

#[test]
fn clamped_reads_replicate_edges() {
    let img = Image::from_vec(4, 2, vec![1u8, 2, 3, 4, 5, 6, 7, 8]);
    assert_eq!(img.get_clamped(-1, 0), 1);
    assert_eq!(img.get_clamped(4, 0), 4);
    assert_eq!(img.get_clamped(3, 9), 8);
    assert_eq!(img.get_clamped(-100, 100), 5);
}

#[test]
fn fields_interleave_back() {
    let img = Image::from_vec(1, 6, vec![0u8, 1, 2, 3, 4, 5]);
    let (top, bottom) = (img.field(0), img.field(1));
    let mut woven: Image<u8> = Image::new(1, 6);
    for y in 0..3 {
        woven.set(0, 2 * y, top.get(0, y));
        woven.set(0, 2 * y + 1, bottom.get(0, y));
    }
    assert_eq!(woven, img);
}

// ===== Result fields =====

#[test]
fn vector_words_decode_in_place() {
    let words = [MotionVector::new(-4, 7).pack(), MotionVector::new(12, -8).pack()];
    let v = mv_view(&words);
    assert_eq!(v[0], MotionVector::new(-4, 7));
    assert_eq!(v[1], MotionVector::new(12, -8));
}

#[test]
fn vector_field_block_raster() {
    let grid = MacroblockGrid::new(32, 16);
    let words: Vec<u32> = (0..grid.subblock_count())
        .map(|i| MotionVector::new(i as i16, 0).pack())
        .collect();
    let field = MotionVectorField::from_words(grid, &words);
    // Block (5, 1) is macroblock 1, sub-block row 1 col 1 → index 16 + 5.
    assert_eq!(field.at_block(5, 1), MotionVector::new(21, 0));
    assert_eq!(field.get(1, 0, 5), MotionVector::new(21, 0));
    assert!(!field.all_zero());
}

#[test]
fn shape_field_decodes_codes() {
    let grid = MacroblockGrid::new(64, 16);
    let field = ShapeField::from_words(grid, &[0, 1, 2, 3]);
    assert_eq!(field.get(0, 0), ShapeCode::Shape16x16);
    assert_eq!(field.get(3, 0), ShapeCode::Shape8x8);
    assert_eq!(field.get(3, 0).partitions(), 4);
}

#[test]
fn residual_field_unpacks_halves_and_lays_out() {
    let grid = MacroblockGrid::new(16, 16);
    let words: Vec<u32> = (0..8u32).map(|p| (2 * p) | ((2 * p + 1) << 16)).collect();
    let field = ResidualField::from_words(grid, &words);
    assert_eq!(field.values, (0..16u16).collect::<Vec<_>>());
    let img = field.to_image();
    assert_eq!((img.width(), img.height()), (4, 4));
    assert_eq!(img.get(3, 2), 11);
}
