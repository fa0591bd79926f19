// backend.rs — the compute-device boundary.
//
// The pipeline never talks to wgpu (or to the host reference kernels)
// directly. Everything goes through `ComputeBackend`, which is deliberately
// small: allocate, write, enqueue a kernel, flush/finish, read back.
//
// HANDLES
// ───────
// Resources are named by opaque `u32` handles. A handle is only meaningful
// to the backend that created it; passing it to another backend is an
// `UnknownHandle` error, never undefined behaviour. Handles are `Copy`, so
// the ping-pong pairs in buffers.rs swap them by value.
//
// DISPATCH
// ────────
// A `Dispatch` is a complete description of one kernel launch: which kernel,
// the global/local extents (in work items, like an NDRange), the positional
// argument list and a 64-byte parameter block. `Dispatch::validate()` checks
// the arguments against the kernel's signature before either backend sees
// them, so both backends reject the same malformed launches.
//
// Kernel signatures (positional):
//
//   downsample   [src, dst_2x, dst_4x, dst_8x]                 images
//   hme_tier     [src, ref, pred_in | Null, pred_out]          2 images, 2 buffers
//   refine       [src, ref, pred_2x, mvs, residuals, shapes]   2 images, 4 buffers
//   refine_wpp   refine + [scoreboard]                         2 images, 5 buffers
//
// NEW RUST CONCEPTS
// ──────────────────
// - Trait with a generic consumer: pipeline stages take `&mut B` where
//   `B: ComputeBackend`, so the dispatch path is monomorphised per backend
//   with no dynamic dispatch on the hot path.
// - `#[repr(C)]` + `bytemuck::Pod` — `KernelParams` is uploaded to the GPU
//   as a uniform with `bytemuck::bytes_of`, and the host kernels read the
//   very same struct. One layout, two consumers.

use std::fmt;

use bytemuck::{Pod, Zeroable};

use crate::error::BackendError;

// ---------------------------------------------------------------------------
// Handles and arguments
// ---------------------------------------------------------------------------

/// Opaque handle to a backend buffer (flat array of `u32` words).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(pub(crate) u32);

/// Opaque handle to a backend single-channel 8-bit image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageHandle(pub(crate) u32);

/// Store `value` in the first released slot of a handle table, or append.
/// Returns the slot index, which becomes the handle id.
pub(crate) fn claim_slot<T>(slots: &mut Vec<Option<T>>, value: T) -> u32 {
    match slots.iter().position(Option::is_none) {
        Some(i) => {
            slots[i] = Some(value);
            i as u32
        }
        None => {
            slots.push(Some(value));
            (slots.len() - 1) as u32
        }
    }
}

impl BufferHandle {
    pub fn id(self) -> u32 {
        self.0
    }
}

impl ImageHandle {
    pub fn id(self) -> u32 {
        self.0
    }
}

/// One positional kernel argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelArg {
    Image(ImageHandle),
    Buffer(BufferHandle),
    /// Placeholder for an absent optional buffer.
    Null,
}

/// What a kernel expects at one argument position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    ImageIn,
    ImageOut,
    BufferIn,
    /// Buffer input that may be `KernelArg::Null`.
    OptionalBufferIn,
    BufferOut,
    /// Read-modify-write buffer (the WPP scoreboard).
    BufferInOut,
}

impl Slot {
    fn accepts(self, arg: &KernelArg) -> bool {
        match (self, arg) {
            (Slot::ImageIn | Slot::ImageOut, KernelArg::Image(_)) => true,
            (Slot::OptionalBufferIn, KernelArg::Null) => true,
            (
                Slot::BufferIn | Slot::OptionalBufferIn | Slot::BufferOut | Slot::BufferInOut,
                KernelArg::Buffer(_),
            ) => true,
            _ => false,
        }
    }

    fn writes(self) -> bool {
        matches!(self, Slot::ImageOut | Slot::BufferOut | Slot::BufferInOut)
    }
}

// ---------------------------------------------------------------------------
// Kernels
// ---------------------------------------------------------------------------

/// The four kernels the pipeline dispatches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kernel {
    Downsample,
    HmeTier,
    Refine,
    RefineWpp,
}

impl Kernel {
    pub const ALL: [Kernel; 4] = [Kernel::Downsample, Kernel::HmeTier, Kernel::Refine, Kernel::RefineWpp];

    pub fn name(self) -> &'static str {
        match self {
            Kernel::Downsample => "downsample",
            Kernel::HmeTier => "hme_tier",
            Kernel::Refine => "refine",
            Kernel::RefineWpp => "refine_wpp",
        }
    }

    fn signature(self) -> &'static [Slot] {
        use Slot::*;
        match self {
            Kernel::Downsample => &[ImageIn, ImageOut, ImageOut, ImageOut],
            Kernel::HmeTier => &[ImageIn, ImageIn, OptionalBufferIn, BufferOut],
            Kernel::Refine => &[ImageIn, ImageIn, BufferIn, BufferOut, BufferOut, BufferOut],
            Kernel::RefineWpp => {
                &[ImageIn, ImageIn, BufferIn, BufferOut, BufferOut, BufferOut, BufferInOut]
            }
        }
    }

    /// Number of positional arguments.
    pub fn arity(self) -> usize {
        self.signature().len()
    }
}

impl fmt::Display for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ---------------------------------------------------------------------------
// Kernel params (must match `Params` in every shader under src/shaders/)
// ---------------------------------------------------------------------------

/// Scalar parameters shared by all kernels.
///
/// Layout (16 × u32 = 64 bytes, no implicit padding):
///   offset  0: width          full-resolution picture width
///   offset  4: height         full-resolution picture height (field height
///                             when interlaced)
///   offset  8: factor         tier downsample factor (hme_tier)
///   offset 12: pred_mb_width  macroblock width of the predictor's grid
///   offset 16: lambda         rate weight derived from QP
///   offset 20: sad_adjust     forwarded verbatim
///   offset 24: subpel         forwarded verbatim
///   offset 28: interlaced     1 → full-res images hold both fields
///   offset 32: polarity       0 = top/even, 1 = bottom/odd
///   offset 36: iterations     macroblock rows per column (refine)
///   offset 40: threads        work groups in the WPP dispatch
///   offset 44: search_range   integer search radius in pixels
///   offset 48: mb_width       macroblock grid of the dispatch's picture
///   offset 52: mb_height
///   offset 56: _pad          word 0 is `has_pred` on the wgpu backend (set
///                             from the hme_tier argument list, not here)
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct KernelParams {
    pub width: u32,
    pub height: u32,
    pub factor: u32,
    pub pred_mb_width: u32,
    pub lambda: u32,
    pub sad_adjust: u32,
    pub subpel: u32,
    pub interlaced: u32,
    pub polarity: u32,
    pub iterations: u32,
    pub threads: u32,
    pub search_range: u32,
    pub mb_width: u32,
    pub mb_height: u32,
    pub _pad: [u32; 2],
}

/// Integer search radius used by the tier and refinement kernels.
pub const SEARCH_RANGE: u32 = 8;

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// A fully-described kernel launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatch {
    pub kernel: Kernel,
    /// Total work items per dimension. Must be a multiple of `local`.
    pub global: [u32; 2],
    /// Work-group size per dimension.
    pub local: [u32; 2],
    pub args: Vec<KernelArg>,
    pub params: KernelParams,
}

impl Dispatch {
    /// Work groups per dimension.
    pub fn groups(&self) -> [u32; 2] {
        [self.global[0] / self.local[0], self.global[1] / self.local[1]]
    }

    /// Check extents and arguments against the kernel signature.
    pub fn validate(&self) -> Result<(), BackendError> {
        let kernel = self.kernel.name();
        let invalid = |reason: String| BackendError::InvalidArgument { kernel, reason };

        for d in 0..2 {
            if self.local[d] == 0 {
                return Err(invalid(format!("local size is zero in dimension {d}")));
            }
            if self.global[d] % self.local[d] != 0 {
                return Err(invalid(format!(
                    "global extent {} is not a multiple of local size {} in dimension {d}",
                    self.global[d], self.local[d]
                )));
            }
        }

        let sig = self.kernel.signature();
        if self.args.len() != sig.len() {
            return Err(invalid(format!(
                "expected {} arguments, got {}",
                sig.len(),
                self.args.len()
            )));
        }
        for (i, (slot, arg)) in sig.iter().zip(&self.args).enumerate() {
            if !slot.accepts(arg) {
                return Err(invalid(format!("argument {i} is {arg:?}, expected {slot:?}")));
            }
        }

        // A written resource may not appear anywhere else in the list.
        for (i, (slot, arg)) in sig.iter().zip(&self.args).enumerate() {
            if !slot.writes() {
                continue;
            }
            let aliased = self
                .args
                .iter()
                .enumerate()
                .any(|(j, other)| j != i && other == arg);
            if aliased {
                return Err(invalid(format!("argument {i} ({arg:?}) is written and aliased")));
            }
        }
        Ok(())
    }

    /// The image handle at position `i`.
    pub fn image(&self, i: usize) -> Result<ImageHandle, BackendError> {
        match self.args.get(i) {
            Some(KernelArg::Image(h)) => Ok(*h),
            other => Err(BackendError::InvalidArgument {
                kernel: self.kernel.name(),
                reason: format!("argument {i} is {other:?}, expected an image"),
            }),
        }
    }

    /// The buffer handle at position `i`, or `None` for `Null`.
    pub fn buffer(&self, i: usize) -> Result<Option<BufferHandle>, BackendError> {
        match self.args.get(i) {
            Some(KernelArg::Buffer(h)) => Ok(Some(*h)),
            Some(KernelArg::Null) => Ok(None),
            other => Err(BackendError::InvalidArgument {
                kernel: self.kernel.name(),
                reason: format!("argument {i} is {other:?}, expected a buffer"),
            }),
        }
    }

    /// Like `buffer`, but `Null` is an error.
    pub fn required_buffer(&self, i: usize) -> Result<BufferHandle, BackendError> {
        self.buffer(i)?.ok_or_else(|| BackendError::InvalidArgument {
            kernel: self.kernel.name(),
            reason: format!("argument {i} must not be null"),
        })
    }
}

// ---------------------------------------------------------------------------
// ComputeBackend
// ---------------------------------------------------------------------------

/// A compute device with a single in-order queue.
///
/// Ordering contract: work is executed in `enqueue_kernel` order. Nothing
/// written by a kernel is guaranteed visible to `read_buffer`/`read_image`
/// until `finish()` returns; the read methods may finish implicitly.
pub trait ComputeBackend {
    /// Human-readable device name for logs.
    fn name(&self) -> String;

    /// The single capability gate: can this device run the pipeline?
    fn supports_motion_estimation(&self) -> bool;

    /// Parallel compute units, used to size the WPP dispatch.
    fn compute_units(&self) -> u32;

    /// Compile every kernel. Failure carries the compiler log verbatim.
    fn build_kernels(&mut self) -> Result<(), BackendError>;

    /// Allocate a zero-initialised buffer of at least `bytes` bytes.
    fn create_buffer(&mut self, bytes: usize) -> Result<BufferHandle, BackendError>;

    /// Allocate a zero-initialised `width × height` 8-bit image.
    fn create_image(&mut self, width: u32, height: u32) -> Result<ImageHandle, BackendError>;

    /// Release a buffer. Unknown handles are ignored.
    fn release_buffer(&mut self, handle: BufferHandle);

    /// Release an image. Unknown handles are ignored.
    fn release_image(&mut self, handle: ImageHandle);

    /// Upload tightly-packed rows (`width * height` bytes) into an image.
    fn write_image(&mut self, handle: ImageHandle, pixels: &[u8]) -> Result<(), BackendError>;

    /// Upload words to the start of a buffer.
    fn write_buffer(&mut self, handle: BufferHandle, words: &[u32]) -> Result<(), BackendError>;

    /// Set every word of a buffer to zero, in queue order.
    fn zero_buffer(&mut self, handle: BufferHandle) -> Result<(), BackendError>;

    /// Queue a kernel launch.
    fn enqueue_kernel(&mut self, dispatch: &Dispatch) -> Result<(), BackendError>;

    /// Submit queued work without waiting.
    fn flush(&mut self) -> Result<(), BackendError>;

    /// Submit queued work and block until the device is idle.
    fn finish(&mut self) -> Result<(), BackendError>;

    /// Read `count` words from the start of a buffer.
    fn read_buffer(&mut self, handle: BufferHandle, count: usize) -> Result<Vec<u32>, BackendError>;

    /// Read an image back as tightly-packed rows.
    fn read_image(&mut self, handle: ImageHandle) -> Result<Vec<u8>, BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_slot_reuses_released() {
        let mut slots: Vec<Option<u8>> = Vec::new();
        assert_eq!(claim_slot(&mut slots, 1), 0);
        assert_eq!(claim_slot(&mut slots, 2), 1);
        assert_eq!(claim_slot(&mut slots, 3), 2);
        slots[1] = None;
        assert_eq!(claim_slot(&mut slots, 4), 1);
        assert_eq!(slots.len(), 3);
        assert_eq!(claim_slot(&mut slots, 5), 3);
    }

    fn refine_dispatch() -> Dispatch {
        Dispatch {
            kernel: Kernel::Refine,
            global: [32, 1],
            local: [16, 1],
            args: vec![
                KernelArg::Image(ImageHandle(0)),
                KernelArg::Image(ImageHandle(1)),
                KernelArg::Buffer(BufferHandle(0)),
                KernelArg::Buffer(BufferHandle(1)),
                KernelArg::Buffer(BufferHandle(2)),
                KernelArg::Buffer(BufferHandle(3)),
            ],
            params: KernelParams::default(),
        }
    }

    #[test]
    fn test_params_layout() {
        assert_eq!(std::mem::size_of::<KernelParams>(), 64);
    }

    #[test]
    fn test_valid_dispatch() {
        let d = refine_dispatch();
        assert!(d.validate().is_ok());
        assert_eq!(d.groups(), [2, 1]);
    }

    #[test]
    fn test_global_not_multiple_of_local() {
        let mut d = refine_dispatch();
        d.global = [40, 1];
        assert!(matches!(d.validate(), Err(BackendError::InvalidArgument { kernel: "refine", .. })));
    }

    #[test]
    fn test_wrong_arity_and_kind() {
        let mut d = refine_dispatch();
        d.args.pop();
        assert!(d.validate().is_err());

        let mut d = refine_dispatch();
        d.args[0] = KernelArg::Buffer(BufferHandle(9));
        assert!(d.validate().is_err());
    }

    #[test]
    fn test_null_only_where_optional() {
        let mut d = Dispatch {
            kernel: Kernel::HmeTier,
            global: [16, 1],
            local: [16, 1],
            args: vec![
                KernelArg::Image(ImageHandle(0)),
                KernelArg::Image(ImageHandle(1)),
                KernelArg::Null,
                KernelArg::Buffer(BufferHandle(0)),
            ],
            params: KernelParams::default(),
        };
        assert!(d.validate().is_ok());
        assert_eq!(d.buffer(2).unwrap(), None);
        d.args[3] = KernelArg::Null;
        assert!(d.validate().is_err());
    }

    #[test]
    fn test_written_alias_rejected() {
        let mut d = refine_dispatch();
        d.args[4] = KernelArg::Buffer(BufferHandle(1));
        assert!(d.validate().is_err());
        // Two reads of the same image are fine.
        let mut d = refine_dispatch();
        d.args[1] = KernelArg::Image(ImageHandle(0));
        assert!(d.validate().is_ok());
    }

    #[test]
    fn test_kernel_names() {
        assert_eq!(Kernel::RefineWpp.to_string(), "refine_wpp");
        assert_eq!(Kernel::RefineWpp.arity(), 7);
        assert_eq!(Kernel::Downsample.arity(), 4);
    }
}
