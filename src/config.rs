// config.rs — resolved run configuration.
//
// The CLI (src/main.rs) parses into `RunConfig`; library users build one
// directly. `validate()` is the single gate that rejects bad input before
// any device work is issued: a QP above 51 never reaches a dispatch.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::ConfigError;

/// Highest valid quantization parameter.
pub const MAX_QP: u32 = 51;

/// Default multiplier applied to the compute-unit count to size the WPP
/// dispatch.
pub const DEFAULT_WPP_THREAD_FACTOR: u32 = 7;

/// Motion-cost lambda per QP: round(sqrt(0.85 * 2^((qp - 12) / 3))), min 1.
const QP_LAMBDA: [u32; (MAX_QP + 1) as usize] = [
    1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 2, 2, 2, 2, 3, 3, 3, 4, 4,
    5, 5, 6, 7, 7, 8, 9, 10, 12, 13, 15, 17, 19, 21, 23, 26, 30, 33, 37, 42, 47,
    53, 59, 66, 74, 83,
];

// ---------------------------------------------------------------------------
// Opaque kernel modes
// ---------------------------------------------------------------------------

/// Distortion adjustment applied to every 4×4 block. The numeric value is
/// forwarded to the kernel verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SadAdjust {
    #[default]
    None,
    Haar,
}

impl SadAdjust {
    pub fn code(self) -> u32 {
        match self {
            SadAdjust::None => 0,
            SadAdjust::Haar => 2,
        }
    }
}

impl FromStr for SadAdjust {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(SadAdjust::None),
            "haar" => Ok(SadAdjust::Haar),
            _ => Err(ConfigError::UnknownMode { what: "SAD adjustment", value: s.to_string() }),
        }
    }
}

/// Sub-pixel refinement precision. Forwarded verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubpelMode {
    Integer,
    Half,
    #[default]
    Quarter,
}

impl SubpelMode {
    pub fn code(self) -> u32 {
        match self {
            SubpelMode::Integer => 0,
            SubpelMode::Half => 1,
            SubpelMode::Quarter => 3,
        }
    }
}

impl FromStr for SubpelMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "integer" | "int" => Ok(SubpelMode::Integer),
            "half" | "hpel" => Ok(SubpelMode::Half),
            "quarter" | "qpel" => Ok(SubpelMode::Quarter),
            _ => Err(ConfigError::UnknownMode { what: "sub-pixel mode", value: s.to_string() }),
        }
    }
}

/// Tuning parameters shared by every refinement variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeParams {
    pub qp: u32,
    pub sad_adjust: SadAdjust,
    pub subpel: SubpelMode,
}

impl Default for MeParams {
    fn default() -> Self {
        MeParams { qp: 26, sad_adjust: SadAdjust::None, subpel: SubpelMode::Quarter }
    }
}

impl MeParams {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.qp > MAX_QP {
            return Err(ConfigError::InvalidQp(self.qp));
        }
        Ok(())
    }

    /// Rate weight for this QP. Only meaningful after `validate()`.
    pub fn lambda(&self) -> u32 {
        QP_LAMBDA[self.qp.min(MAX_QP) as usize]
    }
}

// ---------------------------------------------------------------------------
// Sub-test / backend selection
// ---------------------------------------------------------------------------

/// Which refinement variant the run exercises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubTest {
    #[default]
    Hme,
    Wpp,
    InterlacedNative,
    InterlacedSplit,
}

impl SubTest {
    pub fn is_interlaced(self) -> bool {
        matches!(self, SubTest::InterlacedNative | SubTest::InterlacedSplit)
    }
}

impl FromStr for SubTest {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "hme" => Ok(SubTest::Hme),
            "wpp" => Ok(SubTest::Wpp),
            "interlaced-native" | "native" => Ok(SubTest::InterlacedNative),
            "interlaced-split" | "split" => Ok(SubTest::InterlacedSplit),
            _ => Err(ConfigError::UnknownSubTest(s.to_string())),
        }
    }
}

impl fmt::Display for SubTest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubTest::Hme => write!(f, "hme"),
            SubTest::Wpp => write!(f, "wpp"),
            SubTest::InterlacedNative => write!(f, "interlaced-native"),
            SubTest::InterlacedSplit => write!(f, "interlaced-split"),
        }
    }
}

/// Which compute backend executes the kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    /// Host reference kernels. Always available.
    #[default]
    Cpu,
    /// wgpu compute pipelines.
    Gpu,
}

impl FromStr for BackendKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cpu" | "host" => Ok(BackendKind::Cpu),
            "gpu" | "wgpu" => Ok(BackendKind::Gpu),
            _ => Err(ConfigError::UnknownMode { what: "backend", value: s.to_string() }),
        }
    }
}

// ---------------------------------------------------------------------------
// RunConfig
// ---------------------------------------------------------------------------

/// Fully resolved configuration for one run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub width: u32,
    pub height: u32,
    /// Raw I420 input. `None` means the caller supplies its own source.
    pub input: Option<PathBuf>,
    /// Raw I420 output with overlaid vectors.
    pub output: Option<PathBuf>,
    /// Frame-count limit; 0 means every available frame.
    pub max_frames: usize,
    pub subtest: SubTest,
    pub params: MeParams,
    pub backend: BackendKind,
    /// Multiplier on the compute-unit count for the WPP dispatch width.
    pub wpp_thread_factor: u32,
    /// Overrides the backend's reported compute-unit count.
    pub compute_units: Option<u32>,
    /// Treat "device unsupported" as a skip instead of a failure.
    pub allow_skips: bool,
    /// Read the next frame on a background thread.
    pub prefetch: bool,
    /// Draw motion vectors into the output frames.
    pub overlay: bool,
    /// Optional text dump of every frame's vector field.
    pub dump_mvs: Option<PathBuf>,
}

impl Default for RunConfig {
    fn default() -> Self {
        RunConfig {
            width: 176,
            height: 144,
            input: None,
            output: None,
            max_frames: 0,
            subtest: SubTest::Hme,
            params: MeParams::default(),
            backend: BackendKind::Cpu,
            wpp_thread_factor: DEFAULT_WPP_THREAD_FACTOR,
            compute_units: None,
            allow_skips: false,
            prefetch: true,
            overlay: true,
            dump_mvs: None,
        }
    }
}

impl RunConfig {
    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn with_subtest(mut self, subtest: SubTest) -> Self {
        self.subtest = subtest;
        self
    }

    pub fn with_qp(mut self, qp: u32) -> Self {
        self.params.qp = qp;
        self
    }

    pub fn with_max_frames(mut self, max_frames: usize) -> Self {
        self.max_frames = max_frames;
        self
    }

    pub fn with_output(mut self, output: impl Into<PathBuf>) -> Self {
        self.output = Some(output.into());
        self
    }

    /// Reject anything that must never reach the device.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.params.validate()?;
        if self.width == 0 || self.height == 0 {
            return Err(ConfigError::InvalidDimensions {
                width: self.width,
                height: self.height,
                reason: "width and height must be non-zero",
            });
        }
        if self.width % 2 != 0 || self.height % 2 != 0 {
            return Err(ConfigError::InvalidDimensions {
                width: self.width,
                height: self.height,
                reason: "I420 frames need even dimensions",
            });
        }
        if self.subtest.is_interlaced() && self.height % 4 != 0 {
            return Err(ConfigError::InvalidDimensions {
                width: self.width,
                height: self.height,
                reason: "interlaced fields need a height divisible by 4",
            });
        }
        if self.wpp_thread_factor == 0 || self.compute_units == Some(0) {
            return Err(ConfigError::InvalidThreadFactor);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qp_bound() {
        assert!(RunConfig::default().with_qp(51).validate().is_ok());
        assert_eq!(
            RunConfig::default().with_qp(52).validate(),
            Err(ConfigError::InvalidQp(52))
        );
    }

    #[test]
    fn test_lambda_monotonic() {
        for qp in 1..=MAX_QP {
            let lo = MeParams { qp: qp - 1, ..MeParams::default() }.lambda();
            let hi = MeParams { qp, ..MeParams::default() }.lambda();
            assert!(hi >= lo, "lambda decreased at qp {qp}");
        }
        assert_eq!(MeParams { qp: 0, ..MeParams::default() }.lambda(), 1);
        assert_eq!(MeParams { qp: 51, ..MeParams::default() }.lambda(), 83);
    }

    #[test]
    fn test_subtest_parse() {
        assert_eq!("hme".parse::<SubTest>().unwrap(), SubTest::Hme);
        assert_eq!("WPP".parse::<SubTest>().unwrap(), SubTest::Wpp);
        assert_eq!("interlaced-split".parse::<SubTest>().unwrap(), SubTest::InterlacedSplit);
        assert_eq!(
            "bogus".parse::<SubTest>(),
            Err(ConfigError::UnknownSubTest("bogus".into()))
        );
        assert_eq!(SubTest::InterlacedNative.to_string(), "interlaced-native");
    }

    #[test]
    fn test_mode_codes_forwarded() {
        assert_eq!(SadAdjust::Haar.code(), 2);
        assert_eq!(SubpelMode::Half.code(), 1);
        assert_eq!("qpel".parse::<SubpelMode>().unwrap().code(), 3);
        assert!("eighth".parse::<SubpelMode>().is_err());
    }

    #[test]
    fn test_dimension_checks() {
        assert!(RunConfig::default().with_size(0, 16).validate().is_err());
        assert!(RunConfig::default().with_size(17, 16).validate().is_err());
        let interlaced = RunConfig::default()
            .with_subtest(SubTest::InterlacedNative)
            .with_size(64, 66);
        assert!(interlaced.validate().is_err());
        assert!(interlaced.with_size(64, 64).validate().is_ok());
    }

    #[test]
    fn test_thread_factor_checked() {
        let cfg = RunConfig { wpp_thread_factor: 0, ..RunConfig::default() };
        assert_eq!(cfg.validate(), Err(ConfigError::InvalidThreadFactor));
    }
}
