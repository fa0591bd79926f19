// pyramid-me: hierarchical block motion estimation on a compute device
//
// Pipeline per frame: full-res upload → 2×/4×/8× pyramid → coarse-to-fine
// predictor cascade → full-res refinement (column or wavefront order) →
// vectors, partition shapes and residuals read back to the host.

pub mod align;
pub mod image;
pub mod mv;
pub mod error;
pub mod config;

pub mod backend;
mod kernels;
pub mod cpu;
pub mod gpu;

pub mod buffers;
pub mod pyramid;
pub mod cascade;
pub mod scoreboard;
pub mod refine;

pub mod frame;
pub mod overlay;
pub mod driver;

pub use backend::{ComputeBackend, Dispatch, Kernel, KernelArg, KernelParams};
pub use config::{BackendKind, MeParams, RunConfig, SadAdjust, SubTest, SubpelMode};
pub use cpu::CpuBackend;
pub use driver::{FrameOutput, FramePipelineDriver, PictureResults, RunSummary, StageTimings};
pub use error::{Error, Result, RunOutcome};
pub use mv::{FrameResults, MotionVector};
