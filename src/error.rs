// error.rs — error taxonomy and run outcome.

use std::path::PathBuf;

use thiserror::Error;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Invalid run configuration. Detected before any device work is issued.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("quantization parameter {0} out of range (0..=51)")]
    InvalidQp(u32),

    #[error("unknown sub-test '{0}' (expected hme, wpp, interlaced-native or interlaced-split)")]
    UnknownSubTest(String),

    #[error("unknown {what} '{value}'")]
    UnknownMode { what: &'static str, value: String },

    #[error("invalid frame dimensions {width}x{height}: {reason}")]
    InvalidDimensions {
        width: u32,
        height: u32,
        reason: &'static str,
    },

    #[error("WPP thread factor and compute-unit count must be at least 1")]
    InvalidThreadFactor,

    #[error("no input given (pass --input or --synthetic)")]
    MissingInput,
}

/// Errors raised by a compute backend.
#[derive(Error, Debug)]
pub enum BackendError {
    /// The device lacks a capability the pipeline needs. The run is
    /// skipped rather than failed.
    #[error("device unsupported: {0}")]
    Unsupported(String),

    /// An adapter was found but the device could not be opened on it.
    /// Unlike `Unsupported`, this fails the run.
    #[error("device request failed: {0}")]
    Device(String),

    /// A kernel failed to compile. `log` is the compiler output verbatim.
    #[error("kernel '{kernel}' failed to build:\n{log}")]
    KernelBuild { kernel: String, log: String },

    #[error("invalid argument for kernel '{kernel}': {reason}")]
    InvalidArgument { kernel: &'static str, reason: String },

    #[error("unknown {kind} handle {id}")]
    UnknownHandle { kind: &'static str, id: u32 },

    #[error("buffer size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },

    #[error("device execution failed: {0}")]
    Execution(String),

    #[error("buffer mapping failed: {0}")]
    Mapping(String),
}

/// Errors from the frame source / sink collaborators.
#[derive(Error, Debug)]
pub enum FrameError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("frame {index} is out of range ({count} frames available)")]
    OutOfRange { index: usize, count: usize },

    #[error("frame is {actual_w}x{actual_h}, expected {expected_w}x{expected_h}")]
    SizeMismatch {
        expected_w: usize,
        expected_h: usize,
        actual_w: usize,
        actual_h: usize,
    },

    #[error("short frame data: expected {expected} bytes, got {actual}")]
    ShortRead { expected: usize, actual: usize },

    #[error("background frame read panicked")]
    PrefetchPanicked,
}

/// Top-level error.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Frame(#[from] FrameError),
}

impl Error {
    /// True when the error means "this device cannot run the test" rather
    /// than "the test failed".
    pub fn is_unsupported(&self) -> bool {
        matches!(self, Error::Backend(BackendError::Unsupported(_)))
    }
}

/// Run-level outcome, distinct from success/failure for skipped runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Passed,
    Skipped,
    Failed,
}

impl RunOutcome {
    /// Process exit code for this outcome.
    pub fn exit_code(self) -> i32 {
        match self {
            RunOutcome::Passed | RunOutcome::Skipped => 0,
            RunOutcome::Failed => 1,
        }
    }
}
