// tests/common/mod.rs — helpers shared by the integration tests.
//
// Every helper drives the host backend (`CpuBackend`), so these tests run
// on any machine. GPU parity lives in the ignored tests of src/gpu/.

#![allow(dead_code)]

use pyramid_me::config::{RunConfig, SubTest};
use pyramid_me::cpu::CpuBackend;
use pyramid_me::driver::{FramePipelineDriver, PictureResults, Samples};
use pyramid_me::frame::{Frame, FrameSource, Pattern, SyntheticSource};

/// Config with a fixed compute-unit count, so WPP dispatch widths do not
/// depend on the machine running the test.
pub fn config(subtest: SubTest, width: u32, height: u32) -> RunConfig {
    RunConfig {
        compute_units: Some(3),
        overlay: false,
        prefetch: false,
        ..RunConfig::default().with_size(width, height).with_subtest(subtest)
    }
}

/// One processed frame: what went to the sink, plus the raw results.
pub struct Processed {
    pub frame: Frame,
    pub refined: bool,
    pub results: Vec<PictureResults>,
}

/// Run every frame of `source` through a fresh host pipeline.
pub fn process_all<S: FrameSource>(config: &RunConfig, source: &mut S) -> Vec<Processed> {
    let split = config.subtest == SubTest::InterlacedSplit;
    let mut driver = FramePipelineDriver::new(CpuBackend::with_compute_units(3), config.clone())
        .expect("driver construction");
    (0..source.frame_count())
        .map(|index| {
            let samples = Samples::read(source, index, split).expect("frame read");
            let out = driver.process_frame(index, &samples).expect("frame processed");
            Processed { frame: out.frame, refined: out.refined, results: driver.last_results().to_vec() }
        })
        .collect()
}

pub fn synthetic(width: u32, height: u32, frames: usize, pattern: Pattern) -> SyntheticSource {
    SyntheticSource::new(width, height, frames, pattern)
}
