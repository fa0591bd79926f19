// driver.rs — per-frame orchestration of the whole pipeline.
//
// FRAME LOOP
// ──────────
//   frame 0        read → upload → pyramid → finish → append (unmodified)
//   frame i ≥ 1    swap all pairs → read (prefetched) → upload → pyramid
//                  → cascade → refine → finish → read results → overlay
//                  → append
//   after loop     sink.write_to_file(output)
//
// Frame 0 only primes the reference slots: there is nothing to compare it
// with, so it gets no refinement and no overlay.
//
// LANES
// ─────
// A lane is everything one picture needs on the device: pyramid levels,
// predictor buffers, result buffers and (WPP only) a scoreboard. A
// progressive run has one lane. Interlaced runs have one lane per field:
//
//   sub-test            full-res pairs          lanes
//   ──────────────────  ──────────────────────  ───────────────────────────
//   hme / wpp           1 × (w × h)             frame
//   interlaced-native   1 × (w × h), shared     top, bottom (read in place)
//   interlaced-split    2 × (w × h/2)           top, bottom (own images)
//
// Both field variants build identical coarse levels and run identical
// searches, so their vectors agree field for field.
//
// PREFETCH
// ────────
// While frame i is on the device, frame i+1 is read on a scoped thread. The
// thread is joined before frame i+1's upload, so the source is never touched
// from two places at once.
//
// NEW RUST CONCEPTS
// ──────────────────
// - `std::thread::scope`: the prefetch thread borrows `&mut source` while
//   the main thread borrows `&mut self`. The scope guarantees the join, so
//   no `Arc`/`Mutex` is needed.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use tracing::{debug, error, info, warn};

use crate::backend::ComputeBackend;
use crate::buffers::{FrameBufferPair, PredictorBuffers, ResultBuffers, TierImages};
use crate::cascade::PredictorCascade;
use crate::config::{BackendKind, RunConfig, SubTest};
use crate::cpu::CpuBackend;
use crate::error::{BackendError, ConfigError, FrameError, Result, RunOutcome};
use crate::frame::{FieldSelect, Frame, FrameSink, FrameSource, Polarity, YuvFileSink, YuvFileSource};
use crate::mv::{FrameResults, Tier};
use crate::overlay;
use crate::pyramid::ResolutionPyramidBuilder;
use crate::refine::{PictureLayout, RefinementStage};
use crate::scoreboard::WppScoreboard;

// ---------------------------------------------------------------------------
// Timing
// ---------------------------------------------------------------------------

/// Wall-clock seconds spent per stage for one frame.
///
/// On an asynchronous backend the device stages measure enqueue time only;
/// the device work lands in `finish`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StageTimings {
    pub read: f64,
    pub upload: f64,
    pub pyramid: f64,
    pub cascade: f64,
    pub refine: f64,
    pub finish: f64,
    pub readback: f64,
    pub overlay: f64,
    pub total: f64,
}

impl StageTimings {
    /// Accumulate another frame's timings.
    pub fn add(&mut self, other: &StageTimings) {
        self.read += other.read;
        self.upload += other.upload;
        self.pyramid += other.pyramid;
        self.cascade += other.cascade;
        self.refine += other.refine;
        self.finish += other.finish;
        self.readback += other.readback;
        self.overlay += other.overlay;
        self.total += other.total;
    }
}

impl std::fmt::Display for StageTimings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ms = |s: f64| s * 1e3;
        write!(
            f,
            "read {:.2}ms upload {:.2}ms pyramid {:.2}ms cascade {:.2}ms refine {:.2}ms \
             finish {:.2}ms readback {:.2}ms overlay {:.2}ms total {:.2}ms",
            ms(self.read),
            ms(self.upload),
            ms(self.pyramid),
            ms(self.cascade),
            ms(self.refine),
            ms(self.finish),
            ms(self.readback),
            ms(self.overlay),
            ms(self.total),
        )
    }
}

// ---------------------------------------------------------------------------
// Samples and results
// ---------------------------------------------------------------------------

/// Host pixels for one frame index, as the sub-test needs them.
#[derive(Debug, Clone)]
pub enum Samples {
    Frame(Frame),
    Fields { top: Frame, bottom: Frame },
}

impl Samples {
    /// Read frame `index` from `source`.
    pub fn read<S: FrameSource + ?Sized>(source: &mut S, index: usize, split_fields: bool) -> std::result::Result<Self, FrameError> {
        if split_fields {
            let mut top = Frame::new(0, 0);
            let mut bottom = Frame::new(0, 0);
            source.get_sample(index, &mut top, FieldSelect::Field(Polarity::Top))?;
            source.get_sample(index, &mut bottom, FieldSelect::Field(Polarity::Bottom))?;
            Ok(Samples::Fields { top, bottom })
        } else {
            let mut frame = Frame::new(0, 0);
            source.get_sample(index, &mut frame, FieldSelect::Frame)?;
            Ok(Samples::Frame(frame))
        }
    }

    /// Full-frame dimensions.
    pub fn frame_size(&self) -> (u32, u32) {
        match self {
            Samples::Frame(f) => (f.width(), f.height()),
            Samples::Fields { top, .. } => (top.width(), top.height() * 2),
        }
    }

    /// The frame written to the sink.
    pub fn output_frame(&self) -> std::result::Result<Frame, FrameError> {
        match self {
            Samples::Frame(f) => Ok(f.clone()),
            Samples::Fields { top, bottom } => Frame::weave(top, bottom),
        }
    }

    /// Picture uploaded into full-resolution pair `i`.
    fn upload_picture(&self, i: usize) -> &Frame {
        match self {
            Samples::Frame(f) => f,
            Samples::Fields { top, bottom } => {
                if i == 0 {
                    top
                } else {
                    bottom
                }
            }
        }
    }
}

/// Refinement output of one picture (the frame, or one field).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PictureResults {
    pub field: Option<Polarity>,
    pub results: FrameResults,
}

/// One processed frame.
#[derive(Debug, Clone)]
pub struct FrameOutput {
    /// The frame to append: input pixels plus any overlay.
    pub frame: Frame,
    /// False for pyramid-only frames.
    pub refined: bool,
    pub timings: StageTimings,
}

/// What a completed run reports.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    /// Frames appended to the sink.
    pub frames: usize,
    /// Frames that went through refinement.
    pub refined: usize,
    pub timings: StageTimings,
}

// ---------------------------------------------------------------------------
// Lanes
// ---------------------------------------------------------------------------

struct Lane {
    layout: PictureLayout,
    /// Index of the full-resolution pair this lane reads.
    full: usize,
    levels: TierImages,
    preds: PredictorBuffers,
    results: ResultBuffers,
    scoreboard: Option<WppScoreboard>,
    pyramid: ResolutionPyramidBuilder,
    cascade: PredictorCascade,
    refine: RefinementStage,
}

impl Lane {
    fn new<B: ComputeBackend>(
        backend: &mut B,
        config: &RunConfig,
        compute_units: u32,
        layout: PictureLayout,
        full: usize,
        width: u32,
        height: u32,
    ) -> std::result::Result<Self, BackendError> {
        let pyramid = match layout {
            PictureLayout::NativeField(p) => ResolutionPyramidBuilder::native_field(width, height, p),
            _ => ResolutionPyramidBuilder::new(width, height),
        };
        let cascade = PredictorCascade::new(width, height, &config.params);
        let refine = match config.subtest {
            SubTest::Wpp => {
                RefinementStage::wpp(width, height, config.params, compute_units, config.wpp_thread_factor)
            }
            _ => RefinementStage::plain(width, height, config.params),
        }
        .with_layout(layout);
        let scoreboard = match config.subtest {
            SubTest::Wpp => Some(WppScoreboard::new(backend, refine.grid().mb_width)?),
            _ => None,
        };
        Ok(Lane {
            layout,
            full,
            levels: TierImages::new(backend, width, height)?,
            preds: PredictorBuffers::new(backend, width, height)?,
            results: ResultBuffers::new(backend, refine.grid())?,
            scoreboard,
            pyramid,
            cascade,
            refine,
        })
    }

    fn release<B: ComputeBackend>(self, backend: &mut B) {
        self.levels.release(backend);
        self.preds.release(backend);
        self.results.release(backend);
        if let Some(sb) = self.scoreboard {
            sb.release(backend);
        }
    }
}

// ---------------------------------------------------------------------------
// FramePipelineDriver
// ---------------------------------------------------------------------------

/// Owns the backend and every persistent device buffer for one run.
pub struct FramePipelineDriver<B: ComputeBackend> {
    backend: B,
    config: RunConfig,
    width: u32,
    height: u32,
    full: Vec<FrameBufferPair>,
    lanes: Vec<Lane>,
    /// Frames processed since the buffers were (re)allocated.
    frames_since_alloc: usize,
    last_results: Vec<PictureResults>,
    dump: Option<(PathBuf, BufWriter<File>)>,
}

impl<B: ComputeBackend> FramePipelineDriver<B> {
    /// Validate `config`, check the device, build the kernels and allocate
    /// every buffer. Nothing is dispatched.
    pub fn new(mut backend: B, config: RunConfig) -> Result<Self> {
        config.validate()?;
        if !backend.supports_motion_estimation() {
            return Err(BackendError::Unsupported(format!(
                "{} cannot run the motion-estimation kernels",
                backend.name()
            ))
            .into());
        }
        backend.build_kernels()?;
        info!(device = %backend.name(), subtest = %config.subtest, "pipeline ready");

        let dump = match &config.dump_mvs {
            Some(path) => {
                let file = File::create(path).map_err(|source| FrameError::Io { path: path.clone(), source })?;
                Some((path.clone(), BufWriter::new(file)))
            }
            None => None,
        };

        let mut driver = FramePipelineDriver {
            backend,
            width: config.width,
            height: config.height,
            config,
            full: Vec::new(),
            lanes: Vec::new(),
            frames_since_alloc: 0,
            last_results: Vec::new(),
            dump,
        };
        driver.allocate(driver.width, driver.height)?;
        Ok(driver)
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Results of the most recent refined frame, one entry per lane.
    pub fn last_results(&self) -> &[PictureResults] {
        &self.last_results
    }

    fn compute_units(&self) -> u32 {
        self.config.compute_units.unwrap_or_else(|| self.backend.compute_units())
    }

    /// (Re)create every device buffer for `width × height` frames.
    fn allocate(&mut self, width: u32, height: u32) -> std::result::Result<(), BackendError> {
        for pair in self.full.drain(..) {
            pair.release(&mut self.backend);
        }
        for lane in self.lanes.drain(..) {
            lane.release(&mut self.backend);
        }

        let cu = self.compute_units();
        let field_h = height / 2;
        let (pairs, lanes): (Vec<(u32, u32)>, Vec<(PictureLayout, usize, u32)>) = match self.config.subtest {
            SubTest::Hme | SubTest::Wpp => (vec![(width, height)], vec![(PictureLayout::Progressive, 0, height)]),
            SubTest::InterlacedNative => (
                vec![(width, height)],
                Polarity::BOTH.iter().map(|&p| (PictureLayout::NativeField(p), 0, field_h)).collect(),
            ),
            SubTest::InterlacedSplit => (
                vec![(width, field_h); 2],
                Polarity::BOTH
                    .iter()
                    .enumerate()
                    .map(|(i, &p)| (PictureLayout::SplitField(p), i, field_h))
                    .collect(),
            ),
        };

        for (w, h) in pairs {
            self.full.push(FrameBufferPair::new(&mut self.backend, w, h)?);
        }
        for (layout, full, h) in lanes {
            let lane = Lane::new(&mut self.backend, &self.config, cu, layout, full, width, h)?;
            self.lanes.push(lane);
        }
        self.width = width;
        self.height = height;
        self.frames_since_alloc = 0;
        debug!(width, height, lanes = self.lanes.len(), compute_units = cu, "buffers allocated");
        Ok(())
    }

    /// Run one frame through the pipeline and return the frame to append.
    pub fn process_frame(&mut self, index: usize, samples: &Samples) -> Result<FrameOutput> {
        let t_total = Instant::now();
        let mut timing = StageTimings::default();

        let (w, h) = samples.frame_size();
        if (w, h) != (self.width, self.height) {
            info!(from = ?(self.width, self.height), to = ?(w, h), "frame size changed, reallocating");
            let check = RunConfig { width: w, height: h, ..self.config.clone() };
            check.validate()?;
            self.allocate(w, h)?;
        }
        let first = self.frames_since_alloc == 0;

        // Swap: last frame's current becomes this frame's reference.
        if !first {
            for pair in &mut self.full {
                pair.swap();
            }
            for lane in &mut self.lanes {
                lane.levels.swap_all();
            }
        }

        let t0 = Instant::now();
        for (i, pair) in self.full.iter_mut().enumerate() {
            let pixels = samples.upload_picture(i).luma_packed();
            self.backend.write_image(pair.current(), &pixels)?;
            pair.mark_written();
        }
        timing.upload = t0.elapsed().as_secs_f64();

        let t0 = Instant::now();
        for lane in &mut self.lanes {
            let src = self.full[lane.full].current();
            lane.pyramid.build(&mut self.backend, src, &mut lane.levels)?;
        }
        timing.pyramid = t0.elapsed().as_secs_f64();

        let mut out = samples.output_frame()?;
        self.frames_since_alloc += 1;

        if first {
            let t0 = Instant::now();
            self.backend.finish()?;
            timing.finish = t0.elapsed().as_secs_f64();
            timing.total = t_total.elapsed().as_secs_f64();
            debug!(frame = index, "pyramid only");
            return Ok(FrameOutput { frame: out, refined: false, timings: timing });
        }

        for lane in &self.lanes {
            if !lane.levels.is_primed() || !self.full[lane.full].is_primed() {
                return Err(BackendError::Execution(format!(
                    "frame {index}: reference buffers hold no previous frame"
                ))
                .into());
            }
        }

        let t0 = Instant::now();
        for lane in &self.lanes {
            lane.cascade.run(&mut self.backend, &lane.levels, &lane.preds)?;
        }
        timing.cascade = t0.elapsed().as_secs_f64();

        let t0 = Instant::now();
        for lane in &self.lanes {
            let pair = &self.full[lane.full];
            lane.refine.run(
                &mut self.backend,
                pair.current(),
                pair.reference(),
                lane.preds.get(Tier::Half),
                &lane.results,
                lane.scoreboard.as_ref(),
            )?;
        }
        self.backend.flush()?;
        timing.refine = t0.elapsed().as_secs_f64();

        let t0 = Instant::now();
        self.backend.finish()?;
        timing.finish = t0.elapsed().as_secs_f64();

        let t0 = Instant::now();
        self.last_results.clear();
        for lane in &self.lanes {
            let results = lane.results.read(&mut self.backend)?;
            self.last_results.push(PictureResults { field: lane.layout.polarity(), results });
        }
        timing.readback = t0.elapsed().as_secs_f64();

        let t0 = Instant::now();
        if self.config.overlay {
            for r in &self.last_results {
                overlay::draw_motion_vectors(&mut out, &r.results, r.field);
            }
        }
        if let Some((path, writer)) = &mut self.dump {
            for r in &self.last_results {
                overlay::dump_motion_vectors(writer, index, r.field, &r.results)
                    .map_err(|source| FrameError::Io { path: path.clone(), source })?;
            }
        }
        timing.overlay = t0.elapsed().as_secs_f64();

        timing.total = t_total.elapsed().as_secs_f64();
        debug!(frame = index, "{timing}");
        Ok(FrameOutput { frame: out, refined: true, timings: timing })
    }

    /// Drive every frame of `source` into `sink`, then write the sink to
    /// `config.output` when set.
    pub fn run<S, K>(&mut self, source: &mut S, sink: &mut K) -> Result<RunSummary>
    where
        S: FrameSource,
        K: FrameSink,
    {
        let available = source.frame_count();
        let count = match self.config.max_frames {
            0 => available,
            n => n.min(available),
        };
        info!(frames = count, available, "starting run");

        let split = self.config.subtest == SubTest::InterlacedSplit;
        let prefetch = self.config.prefetch;
        let mut summary = RunSummary::default();
        if count == 0 {
            return Ok(summary);
        }

        let t0 = Instant::now();
        let mut next = Samples::read(source, 0, split)?;
        let mut read_time = t0.elapsed().as_secs_f64();

        for index in 0..count {
            let samples = next;
            let has_next = index + 1 < count;

            let (processed, fetched) = if prefetch && has_next {
                std::thread::scope(|scope| {
                    let reader = scope.spawn(|| {
                        let t0 = Instant::now();
                        Samples::read(source, index + 1, split).map(|s| (s, t0.elapsed().as_secs_f64()))
                    });
                    let processed = self.process_frame(index, &samples);
                    let fetched = reader.join().map_err(|_| FrameError::PrefetchPanicked);
                    (processed, Some(fetched))
                })
            } else {
                (self.process_frame(index, &samples), None)
            };

            let mut output = processed?;
            output.timings.read = read_time;
            sink.append_frame(&output.frame)?;
            summary.frames += 1;
            summary.refined += output.refined as usize;
            summary.timings.add(&output.timings);

            next = match fetched {
                Some(joined) => {
                    let (s, t) = joined??;
                    read_time = t;
                    s
                }
                None if has_next => {
                    let t0 = Instant::now();
                    let s = Samples::read(source, index + 1, split)?;
                    read_time = t0.elapsed().as_secs_f64();
                    s
                }
                None => break,
            };
        }

        if let Some((path, writer)) = &mut self.dump {
            writer.flush().map_err(|source| FrameError::Io { path: path.clone(), source })?;
        }
        if let Some(path) = &self.config.output {
            sink.write_to_file(path)?;
        }
        info!(frames = summary.frames, refined = summary.refined, "run complete");
        debug!("totals: {}", summary.timings);
        Ok(summary)
    }
}

impl<B: ComputeBackend> Drop for FramePipelineDriver<B> {
    fn drop(&mut self) {
        for pair in self.full.drain(..) {
            pair.release(&mut self.backend);
        }
        for lane in self.lanes.drain(..) {
            lane.release(&mut self.backend);
        }
    }
}

// ---------------------------------------------------------------------------
// Top-level entry points
// ---------------------------------------------------------------------------

/// Run `source` through a freshly built pipeline on `backend`, writing to
/// an in-memory sink (and to `config.output` when set).
pub fn run_with_source<B, S>(backend: B, config: &RunConfig, source: &mut S) -> Result<RunSummary>
where
    B: ComputeBackend,
    S: FrameSource,
{
    let mut driver = FramePipelineDriver::new(backend, config.clone())?;
    let mut sink = YuvFileSink::new();
    driver.run(source, &mut sink)
}

fn open_input(config: &RunConfig) -> Result<YuvFileSource> {
    let path: &Path = config.input.as_deref().ok_or(ConfigError::MissingInput)?;
    Ok(YuvFileSource::open(path, config.width, config.height)?)
}

/// Run `source` on the backend named in `config`.
pub fn run_source<S: FrameSource>(config: &RunConfig, source: &mut S) -> Result<RunSummary> {
    match config.backend {
        BackendKind::Cpu => run_with_source(CpuBackend::new(), config, source),
        BackendKind::Gpu => {
            let backend = crate::gpu::WgpuBackend::new()?;
            run_with_source(backend, config, source)
        }
    }
}

/// Run with the backend and input file named in `config`.
pub fn run(config: &RunConfig) -> Result<RunSummary> {
    config.validate()?;
    let mut source = open_input(config)?;
    run_source(config, &mut source)
}

/// Classify a run result. "Device unsupported" is a skip only when the
/// configuration allows skips.
pub fn outcome_of(result: &Result<RunSummary>, allow_skips: bool) -> RunOutcome {
    match result {
        Ok(_) => RunOutcome::Passed,
        Err(e) if e.is_unsupported() && allow_skips => {
            warn!("skipped: {e}");
            RunOutcome::Skipped
        }
        Err(e) => {
            error!("{e}");
            RunOutcome::Failed
        }
    }
}
