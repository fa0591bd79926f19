// tests/test_pipeline.rs — end-to-end runs of the frame pipeline on the host
// backend.
//
// These run with `cargo test --test test_pipeline`.

mod common;

use common::{config, process_all, synthetic};
use pyramid_me::config::SubTest;
use pyramid_me::cpu::CpuBackend;
use pyramid_me::driver::run_with_source;
use pyramid_me::frame::{i420_frame_size, Pattern};
use pyramid_me::mv::ShapeCode;

// ===== Constant input =====

#[test]
fn constant_frames_give_zero_field() {
    let cfg = config(SubTest::Hme, 128, 128);
    let mut src = synthetic(128, 128, 3, Pattern::Constant(128));
    let out = process_all(&cfg, &mut src);

    assert!(!out[0].refined);
    for p in &out[1..] {
        assert!(p.refined);
        assert_eq!(p.results.len(), 1);
        let r = &p.results[0].results;
        assert!(r.mvs.all_zero(), "non-zero vector on a constant picture");
        assert!(r.residuals.all_zero());
        assert!(r.shapes.shapes.iter().all(|&s| s == ShapeCode::Shape16x16));
    }
}

#[test]
fn single_frame_output_equals_input() {
    let cfg = config(SubTest::Hme, 64, 48);
    let mut src = synthetic(64, 48, 1, Pattern::Moving { dx: 2, dy: 1 });
    let expected = src.render(0);
    let out = process_all(&cfg, &mut src);
    assert_eq!(out.len(), 1);
    assert!(!out[0].refined);
    assert!(out[0].results.is_empty());
    assert_eq!(out[0].frame, expected);
}

// ===== Translation =====

#[test]
fn pan_is_recovered_in_interior() {
    let cfg = config(SubTest::Hme, 96, 80);
    // Frame t samples the texture at (x + 3t, y - 2t), so
    // current(x, y) = reference(x + 3, y - 2): (12, -8) in quarter pels.
    let mut src = synthetic(96, 80, 2, Pattern::Moving { dx: 3, dy: -2 });
    let out = process_all(&cfg, &mut src);
    let r = &out[1].results[0].results;
    for mb_y in 1..r.mvs.grid.mb_height - 1 {
        for mb_x in 1..r.mvs.grid.mb_width - 1 {
            let mv = r.mvs.get(mb_x, mb_y, 5);
            assert_eq!((mv.x, mv.y), (12, -8), "macroblock ({mb_x}, {mb_y})");
        }
    }
}

// ===== HME vs WPP =====

#[test]
fn wpp_matches_hme() {
    for (w, h) in [(96u32, 64u32), (176, 144), (80, 48)] {
        let mut a = synthetic(w, h, 3, Pattern::Moving { dx: -2, dy: 3 });
        let mut b = synthetic(w, h, 3, Pattern::Moving { dx: -2, dy: 3 });
        let hme = process_all(&config(SubTest::Hme, w, h), &mut a);
        let wpp = process_all(&config(SubTest::Wpp, w, h), &mut b);
        for (i, (x, y)) in hme.iter().zip(&wpp).enumerate() {
            assert_eq!(x.results, y.results, "{w}x{h} frame {i}: WPP differs from HME");
            assert_eq!(x.frame, y.frame);
        }
    }
}

#[test]
fn wpp_independent_of_thread_factor() {
    let base = config(SubTest::Wpp, 112, 64);
    let mut first = None;
    for factor in [1u32, 2, 7] {
        let cfg = pyramid_me::config::RunConfig { wpp_thread_factor: factor, ..base.clone() };
        let mut src = synthetic(112, 64, 2, Pattern::Gradient { dx: 1, dy: 2 });
        let results = process_all(&cfg, &mut src).pop().map(|p| p.results);
        match &first {
            None => first = results,
            Some(f) => assert_eq!(Some(f), results.as_ref(), "factor {factor}"),
        }
    }
}

// ===== Idempotence =====

#[test]
fn rerun_writes_identical_files() {
    let dir = tempfile::tempdir().unwrap();
    let mut outputs = Vec::new();
    for run in 0..2 {
        let path = dir.path().join(format!("out{run}.yuv"));
        let cfg = pyramid_me::config::RunConfig {
            overlay: true,
            ..config(SubTest::Hme, 64, 48).with_output(&path)
        };
        let mut src = synthetic(64, 48, 4, Pattern::Moving { dx: 4, dy: 1 });
        let summary = run_with_source(CpuBackend::with_compute_units(3), &cfg, &mut src).unwrap();
        assert_eq!((summary.frames, summary.refined), (4, 3));
        outputs.push(std::fs::read(&path).unwrap());
    }
    assert_eq!(outputs[0].len(), 4 * i420_frame_size(64, 48));
    assert_eq!(outputs[0], outputs[1]);
}

#[test]
fn prefetch_does_not_change_output() {
    let dir = tempfile::tempdir().unwrap();
    let mut outputs = Vec::new();
    for prefetch in [false, true] {
        let path = dir.path().join(format!("prefetch_{prefetch}.yuv"));
        let cfg = pyramid_me::config::RunConfig {
            prefetch,
            overlay: true,
            ..config(SubTest::Wpp, 80, 64).with_output(&path)
        };
        let mut src = synthetic(80, 64, 3, Pattern::Moving { dx: 1, dy: 1 });
        run_with_source(CpuBackend::with_compute_units(3), &cfg, &mut src).unwrap();
        outputs.push(std::fs::read(&path).unwrap());
    }
    assert_eq!(outputs[0], outputs[1]);
}

// ===== Limits =====

#[test]
fn max_frames_limits_run() {
    let cfg = config(SubTest::Hme, 32, 32).with_max_frames(2);
    let mut src = synthetic(32, 32, 5, Pattern::Constant(9));
    let summary = run_with_source(CpuBackend::new(), &cfg, &mut src).unwrap();
    assert_eq!(summary.frames, 2);
    assert_eq!(summary.refined, 1);
}

#[test]
fn invalid_qp_is_config_error() {
    let cfg = config(SubTest::Hme, 32, 32).with_qp(99);
    let mut src = synthetic(32, 32, 2, Pattern::Constant(9));
    let err = run_with_source(CpuBackend::new(), &cfg, &mut src).unwrap_err();
    assert!(!err.is_unsupported());
    assert!(err.to_string().contains("99"));
}
