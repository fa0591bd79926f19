// tests/test_pyramid.rs — the downsample dispatch against the plain box
// reduction, through the public backend API.

use pyramid_me::backend::ComputeBackend;
use pyramid_me::buffers::TierImages;
use pyramid_me::cpu::CpuBackend;
use pyramid_me::frame::{Pattern, Polarity, SyntheticSource};
use pyramid_me::image::Image;
use pyramid_me::mv::Tier;
use pyramid_me::pyramid::{box_downsample, ResolutionPyramidBuilder};

fn luma(width: u32, height: u32, pattern: Pattern) -> Image<u8> {
    SyntheticSource::new(width, height, 1, pattern).render(0).luma().clone()
}

fn packed(img: &Image<u8>) -> Vec<u8> {
    (0..img.height()).flat_map(|y| img.row(y).to_vec()).collect()
}

/// Run the pyramid dispatch for `src` and read back the three levels.
fn levels_of(src: &Image<u8>, builder: ResolutionPyramidBuilder, level_h: u32) -> Vec<Vec<u8>> {
    let mut backend = CpuBackend::new();
    backend.build_kernels().unwrap();
    let w = src.width() as u32;
    let img = backend.create_image(w, src.height() as u32).unwrap();
    backend.write_image(img, &packed(src)).unwrap();
    let mut levels = TierImages::new(&mut backend, w, level_h).unwrap();
    builder.build(&mut backend, img, &mut levels).unwrap();
    backend.finish().unwrap();
    [Tier::Half, Tier::Quarter, Tier::Eighth]
        .iter()
        .map(|&t| backend.read_image(levels.pair(t).current()).unwrap())
        .collect()
}

#[test]
fn levels_match_box_downsample() {
    for (w, h) in [(64u32, 48u32), (70, 38), (176, 144), (18, 10)] {
        let src = luma(w, h, Pattern::Moving { dx: 0, dy: 0 });
        let got = levels_of(&src, ResolutionPyramidBuilder::new(w, h), h);
        for (level, f) in got.iter().zip([2u32, 4, 8]) {
            assert_eq!(level, &packed(&box_downsample(&src, f)), "{w}x{h} at {f}x");
        }
    }
}

#[test]
fn constant_picture_stays_constant() {
    let src = Image::filled(40, 24, 93u8);
    for level in levels_of(&src, ResolutionPyramidBuilder::new(40, 24), 24) {
        assert!(level.iter().all(|&v| v == 93));
    }
}

#[test]
fn native_field_levels_match_extracted_field() {
    let full = luma(48, 64, Pattern::Interlaced { dx: 1, dy: 1 });
    for p in Polarity::BOTH {
        let field = full.field(p.index() as usize);
        let native = levels_of(&full, ResolutionPyramidBuilder::native_field(48, 32, p), 32);
        let split = levels_of(&field, ResolutionPyramidBuilder::new(48, 32), 32);
        assert_eq!(native, split, "{p:?}");
    }
}

#[test]
fn extent_covers_every_strip() {
    let b = ResolutionPyramidBuilder::new(100, 70);
    let [gx, gy] = b.global_extent();
    assert_eq!(gx % 16, 0);
    assert!(gx * 4 >= 100);
    assert!(gy * 16 >= 70);
}
