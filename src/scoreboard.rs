// scoreboard.rs — host side of the wavefront scoreboard.
//
// The WPP refinement kernel keeps one completion counter per macroblock
// column: `scoreboard[x] = y + 1` once macroblock `(x, y)` is done, and
// macroblock `(x, y)` may start only when
// `scoreboard[min(x + 1, mb_width - 1)] > y - 1`. Rows therefore trail the
// row above by at least one column, forming a diagonal wavefront.
//
// A second block of `mb_width` words follows the counters. Slot
// `mb_width + x` holds the bottom-left vector of the last finished
// macroblock in column `x`, stored before the counter is bumped, so the row
// below reads its top candidate through an atomic rather than from the
// plain `mvs` output.
//
// The host never reads or writes the counters while a dispatch is in
// flight. It only sizes the buffer and zeroes it before every dispatch.

use tracing::debug;

use crate::backend::{BufferHandle, ComputeBackend};
use crate::error::BackendError;

/// Work-group count for a WPP dispatch: one group per macroblock column,
/// capped at `compute_units * thread_factor`.
pub fn wpp_threads(mb_width: u32, compute_units: u32, thread_factor: u32) -> u32 {
    let max_threads = compute_units.max(1).saturating_mul(thread_factor.max(1));
    mb_width.min(max_threads).max(1)
}

/// Per-column completion counters and published top vectors for one picture.
#[derive(Debug)]
pub struct WppScoreboard {
    buffer: BufferHandle,
    mb_width: u32,
}

impl WppScoreboard {
    pub fn new<B: ComputeBackend>(backend: &mut B, mb_width: u32) -> Result<Self, BackendError> {
        let buffer = backend.create_buffer(Self::words(mb_width) * 4)?;
        Ok(WppScoreboard { buffer, mb_width })
    }

    /// Buffer length in words: counters plus one vector slot per column.
    pub fn words(mb_width: u32) -> usize {
        2 * mb_width as usize
    }

    pub fn buffer(&self) -> BufferHandle {
        self.buffer
    }

    pub fn mb_width(&self) -> u32 {
        self.mb_width
    }

    /// Zero every counter and vector slot. Queued, so it lands before the next dispatch.
    pub fn reset<B: ComputeBackend>(&self, backend: &mut B) -> Result<(), BackendError> {
        backend.zero_buffer(self.buffer)
    }

    /// Reallocate when the macroblock width changes. No-op otherwise.
    pub fn resize<B: ComputeBackend>(&mut self, backend: &mut B, mb_width: u32) -> Result<(), BackendError> {
        if mb_width == self.mb_width {
            return Ok(());
        }
        debug!(from = self.mb_width, to = mb_width, "resizing scoreboard");
        let buffer = backend.create_buffer(Self::words(mb_width) * 4)?;
        backend.release_buffer(self.buffer);
        self.buffer = buffer;
        self.mb_width = mb_width;
        Ok(())
    }

    /// Current counter values (the vector slots are not included). Only
    /// meaningful after `finish()`.
    pub fn snapshot<B: ComputeBackend>(&self, backend: &mut B) -> Result<Vec<u32>, BackendError> {
        backend.read_buffer(self.buffer, self.mb_width as usize)
    }

    pub fn release<B: ComputeBackend>(self, backend: &mut B) {
        backend.release_buffer(self.buffer);
    }
}
