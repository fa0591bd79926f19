// main.rs — run hierarchical motion estimation over a raw I420 clip and
// write the clip back with the vectors drawn in.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use tracing::info;

use pyramid_me::config::{
    BackendKind, MeParams, RunConfig, SadAdjust, SubTest, SubpelMode, DEFAULT_WPP_THREAD_FACTOR,
};
use pyramid_me::driver::{self, RunSummary};
use pyramid_me::frame::{Pattern, SyntheticSource};
use pyramid_me::Result;

/// Built-in test clips for runs without an input file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum SyntheticClip {
    /// Mid-grey, no motion.
    Constant,
    /// Noise texture panning 3 px right, 2 px down per frame.
    Moving,
    /// Smooth gradient panning 2 px left per frame.
    Gradient,
    /// Interlaced capture of a texture panning 4 px right per frame.
    Interlaced,
}

impl SyntheticClip {
    fn pattern(self) -> Pattern {
        match self {
            SyntheticClip::Constant => Pattern::Constant(128),
            SyntheticClip::Moving => Pattern::Moving { dx: 3, dy: 2 },
            SyntheticClip::Gradient => Pattern::Gradient { dx: -2, dy: 0 },
            SyntheticClip::Interlaced => Pattern::Interlaced { dx: 4, dy: 0 },
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "pyramid-me")]
#[command(about = "Hierarchical block motion estimation on a compute device", long_about = None)]
#[command(version)]
struct Cli {
    /// Frame width in pixels
    #[arg(long, default_value_t = 176)]
    width: u32,

    /// Frame height in pixels
    #[arg(long, default_value_t = 144)]
    height: u32,

    /// Raw I420 input clip
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Use a generated clip instead of --input
    #[arg(long, value_enum, conflicts_with = "input")]
    synthetic: Option<SyntheticClip>,

    /// Frames in the generated clip
    #[arg(long, default_value_t = 8)]
    synthetic_frames: usize,

    /// Raw I420 output with overlaid vectors
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Quantization parameter (0-51)
    #[arg(long, default_value_t = 26)]
    qp: u32,

    /// Stop after this many frames (0 = all)
    #[arg(long, default_value_t = 0)]
    max_frames: usize,

    /// hme, wpp, interlaced-native or interlaced-split
    #[arg(long, default_value = "hme")]
    subtest: SubTest,

    /// Block distortion: none or haar
    #[arg(long, default_value = "none")]
    sad_adjust: SadAdjust,

    /// Sub-pixel precision: integer, half or quarter
    #[arg(long, default_value = "quarter")]
    subpel: SubpelMode,

    /// Compute backend: cpu or gpu
    #[arg(long, default_value = "cpu")]
    backend: BackendKind,

    /// WPP threads per compute unit
    #[arg(long, default_value_t = DEFAULT_WPP_THREAD_FACTOR)]
    wpp_thread_factor: u32,

    /// Override the device's compute-unit count
    #[arg(long)]
    compute_units: Option<u32>,

    /// Report an unsupported device as skipped (exit 0)
    #[arg(long)]
    allow_skips: bool,

    /// Read frames on the calling thread
    #[arg(long)]
    no_prefetch: bool,

    /// Do not draw vectors into the output
    #[arg(long)]
    no_overlay: bool,

    /// Write every frame's vectors as text
    #[arg(long)]
    dump_mvs: Option<PathBuf>,

    /// Debug-level logging
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn to_config(&self) -> RunConfig {
        RunConfig {
            width: self.width,
            height: self.height,
            input: self.input.clone(),
            output: self.output.clone(),
            max_frames: self.max_frames,
            subtest: self.subtest,
            params: MeParams { qp: self.qp, sad_adjust: self.sad_adjust, subpel: self.subpel },
            backend: self.backend,
            wpp_thread_factor: self.wpp_thread_factor,
            compute_units: self.compute_units,
            allow_skips: self.allow_skips,
            prefetch: !self.no_prefetch,
            overlay: !self.no_overlay,
            dump_mvs: self.dump_mvs.clone(),
        }
    }
}

fn execute(cli: &Cli, config: &RunConfig) -> Result<RunSummary> {
    config.validate()?;
    match cli.synthetic {
        Some(clip) => {
            let mut source = SyntheticSource::new(config.width, config.height, cli.synthetic_frames, clip.pattern());
            driver::run_source(config, &mut source)
        }
        None => driver::run(config),
    }
}

/// Install the fmt subscriber. Fails if one is already installed.
fn init_logging(verbose: bool) -> std::result::Result<(), tracing::subscriber::SetGlobalDefaultError> {
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(if verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        })
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_logging(cli.verbose) {
        eprintln!("pyramid-me: logging disabled: {e}");
    }

    let config = cli.to_config();
    info!(
        width = config.width,
        height = config.height,
        subtest = %config.subtest,
        qp = config.params.qp,
        "pyramid-me v{}",
        env!("CARGO_PKG_VERSION")
    );

    let result = execute(&cli, &config);
    let outcome = driver::outcome_of(&result, config.allow_skips);
    if let Ok(summary) = &result {
        info!(frames = summary.frames, refined = summary.refined, "{}", summary.timings);
    }
    ExitCode::from(outcome.exit_code() as u8)
}
