// demos/hme_pyramid.rs — motion-field visualiser.
//
// Runs two frames of a synthetic clip through the pipeline and prints the
// resulting vector field as a character map, one cell per macroblock:
//
//   · zero vector       → ← ↑ ↓ ↗ ↖ ↘ ↙ dominant direction
//
// followed by a histogram of partition shapes. When a GPU is present the
// same frames run on both backends and any disagreement is reported.
//
// USAGE
// ─────
//   cargo run --example hme_pyramid                 # 352×288, pan (3, -2)
//   cargo run --example hme_pyramid -- 640 368 5 1  # size and pan

use pyramid_me::config::{RunConfig, SubTest};
use pyramid_me::cpu::CpuBackend;
use pyramid_me::driver::{FramePipelineDriver, PictureResults, Samples};
use pyramid_me::frame::{Pattern, SyntheticSource};
use pyramid_me::gpu::WgpuBackend;
use pyramid_me::mv::{FrameResults, ShapeCode};
use pyramid_me::backend::ComputeBackend;

fn main() {
    let args: Vec<String> = std::env::args().collect();
    let arg = |i: usize, default: i32| args.get(i).and_then(|s| s.parse().ok()).unwrap_or(default);
    let (w, h) = (arg(1, 352) as u32, arg(2, 288) as u32);
    let (dx, dy) = (arg(3, 3), arg(4, -2));

    let config = RunConfig { overlay: false, prefetch: false, ..RunConfig::default().with_size(w, h) };
    eprintln!("[hme_pyramid] {w}×{h}, pan ({dx}, {dy}) px/frame, {}", SubTest::Hme);

    let cpu = field_of(CpuBackend::new(), &config, dx, dy);
    print_field(&cpu[0].results);
    print_shapes(&cpu[0].results);

    match WgpuBackend::new() {
        Ok(gpu) => {
            eprintln!("[hme_pyramid] GPU: {}", gpu.name());
            let g = field_of(gpu, &config, dx, dy);
            if g == cpu {
                eprintln!("[hme_pyramid] GPU and host fields agree");
            } else {
                let diff = g[0]
                    .results
                    .mvs
                    .vectors
                    .iter()
                    .zip(&cpu[0].results.mvs.vectors)
                    .filter(|(a, b)| a != b)
                    .count();
                eprintln!("[hme_pyramid] GPU differs from host in {diff} sub-block vectors");
            }
        }
        Err(e) => eprintln!("[hme_pyramid] no GPU ({e}), host backend only"),
    }
}

fn field_of<B: ComputeBackend>(backend: B, config: &RunConfig, dx: i32, dy: i32) -> Vec<PictureResults> {
    let mut src = SyntheticSource::new(config.width, config.height, 2, Pattern::Moving { dx, dy });
    let mut driver = FramePipelineDriver::new(backend, config.clone()).expect("pipeline setup");
    for index in 0..2 {
        let samples = Samples::read(&mut src, index, false).expect("synthetic frame");
        driver.process_frame(index, &samples).expect("frame");
    }
    driver.last_results().to_vec()
}

fn arrow(x: i16, y: i16) -> char {
    match (x.signum(), y.signum()) {
        (0, 0) => '·',
        (1, 0) => '→',
        (-1, 0) => '←',
        (0, -1) => '↑',
        (0, 1) => '↓',
        (1, -1) => '↗',
        (-1, -1) => '↖',
        (1, 1) => '↘',
        _ => '↙',
    }
}

fn print_field(r: &FrameResults) {
    let grid = r.mvs.grid;
    println!("vector field ({}×{} macroblocks, centre sub-block):", grid.mb_width, grid.mb_height);
    for mb_y in 0..grid.mb_height {
        let row: String = (0..grid.mb_width)
            .map(|mb_x| {
                let mv = r.mvs.get(mb_x, mb_y, 5);
                arrow(mv.x, mv.y)
            })
            .collect();
        println!("  {row}");
    }
}

fn print_shapes(r: &FrameResults) {
    let mut counts = [0usize; 4];
    for &s in &r.shapes.shapes {
        counts[s as usize] += 1;
    }
    for (shape, n) in [ShapeCode::Shape16x16, ShapeCode::Shape16x8, ShapeCode::Shape8x16, ShapeCode::Shape8x8]
        .iter()
        .zip(counts)
    {
        println!("  {shape:?}: {n}");
    }
}
