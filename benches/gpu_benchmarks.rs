// benches/gpu_benchmarks.rs — wgpu backend benchmarks.
//
// Mirrors pipeline_benchmarks.rs. Each GPU benchmark has a host-backend
// twin in the same group for direct comparison.
//
//   cargo bench --bench gpu_benchmarks
//
// Without a usable adapter every benchmark is skipped with a message.
//
//
// CRITERION + GPU CAVEATS
// ────────────────────────
// Criterion measures wall time including CPU overhead (staging copies, bind
// group creation, submit, poll). Shader execution is included in the
// `finish()` wait. That is the right metric here: the driver blocks on the
// refinement results before the next frame.
//
// The first iterations pay pipeline compilation on some drivers, so
// warmup_time is set explicitly.

use criterion::{criterion_group, criterion_main, Criterion};
use std::time::Duration;

use pyramid_me::config::{RunConfig, SubTest};
use pyramid_me::cpu::CpuBackend;
use pyramid_me::driver::run_with_source;
use pyramid_me::frame::{Pattern, SyntheticSource};
use pyramid_me::gpu::WgpuBackend;

// ============================================================
// Shared helpers
// ============================================================

fn gpu_or_skip() -> Option<WgpuBackend> {
    match WgpuBackend::new() {
        Ok(b) => Some(b),
        Err(e) => {
            eprintln!("no usable GPU ({e}), skipping");
            None
        }
    }
}

fn config(subtest: SubTest, w: u32, h: u32) -> RunConfig {
    RunConfig { overlay: false, prefetch: false, ..RunConfig::default().with_size(w, h).with_subtest(subtest) }
}

// ============================================================
// Full pipeline: CPU vs GPU
// ============================================================

fn bench_subtest(c: &mut Criterion, subtest: SubTest, w: u32, h: u32, frames: usize) {
    if gpu_or_skip().is_none() {
        return;
    }
    let cfg = config(subtest, w, h);
    let mut group = c.benchmark_group(format!("{subtest}"));
    group.sample_size(10);
    group.warm_up_time(Duration::from_secs(2));

    group.bench_function(format!("cpu_{w}x{h}_{frames}frames"), |b| {
        b.iter(|| {
            let mut src = SyntheticSource::new(w, h, frames, Pattern::Moving { dx: 3, dy: 1 });
            run_with_source(CpuBackend::new(), &cfg, &mut src).unwrap()
        })
    });

    group.bench_function(format!("gpu_{w}x{h}_{frames}frames"), |b| {
        b.iter(|| {
            let mut src = SyntheticSource::new(w, h, frames, Pattern::Moving { dx: 3, dy: 1 });
            let gpu = WgpuBackend::new().unwrap();
            run_with_source(gpu, &cfg, &mut src).unwrap()
        })
    });

    group.finish();
}

fn bench_hme(c: &mut Criterion) {
    bench_subtest(c, SubTest::Hme, 1280, 720, 4);
}

fn bench_wpp(c: &mut Criterion) {
    bench_subtest(c, SubTest::Wpp, 1280, 720, 4);
}

fn bench_interlaced(c: &mut Criterion) {
    bench_subtest(c, SubTest::InterlacedNative, 720, 576, 4);
    bench_subtest(c, SubTest::InterlacedSplit, 720, 576, 4);
}

// ============================================================
// Device setup cost
// ============================================================

fn bench_device_setup(c: &mut Criterion) {
    if gpu_or_skip().is_none() {
        return;
    }
    let mut group = c.benchmark_group("setup");
    group.sample_size(10);
    group.bench_function("adapter_device_kernels", |b| {
        b.iter(|| {
            use pyramid_me::backend::ComputeBackend;
            let mut gpu = WgpuBackend::new().unwrap();
            gpu.build_kernels().unwrap();
            gpu
        })
    });
    group.finish();
}

// ============================================================
// Register
// ============================================================

criterion_group!(benches, bench_hme, bench_wpp, bench_interlaced, bench_device_setup);
criterion_main!(benches);
