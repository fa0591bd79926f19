// cpu.rs — host reference backend.
//
// `CpuBackend` implements `ComputeBackend` with plain host memory and the
// kernels in kernels.rs. It is always available, so every pipeline test
// runs against it, and it is the baseline the wgpu backend is compared to.
//
// MEMORY
// ──────
// Buffers are page-aligned (`AVec<u8, ConstAlign<PAGE_SIZE>>`), mirroring
// the zero-copy host-visible allocations a discrete device would share with
// the host. Kernels view them as `&[u32]` through `bytemuck::cast_slice`,
// which is sound because the allocation is 4096-aligned and every size is
// rounded to whole pages.
//
// EXECUTION
// ─────────
// Kernels run synchronously inside `enqueue_kernel`, in submission order,
// so `flush`/`finish` have nothing left to wait for. The WPP kernel still
// runs its work groups as concurrent OS threads.

use aligned_vec::{AVec, ConstAlign};
use tracing::{debug, trace};

use crate::align::{align_page, PAGE_SIZE};
use crate::backend::{claim_slot, BufferHandle, ComputeBackend, Dispatch, ImageHandle, Kernel};
use crate::error::BackendError;
use crate::image::Image;
use crate::kernels;

type PageBuffer = AVec<u8, ConstAlign<PAGE_SIZE>>;

fn page_buffer(bytes: usize) -> PageBuffer {
    let len = align_page(bytes.max(1));
    AVec::from_iter(PAGE_SIZE, std::iter::repeat(0u8).take(len))
}

/// Host reference implementation of the compute device.
pub struct CpuBackend {
    buffers: Vec<Option<PageBuffer>>,
    images: Vec<Option<Image<u8>>>,
    compute_units: u32,
    built: bool,
    dispatches: u64,
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuBackend {
    /// Backend sized to the host's available parallelism.
    pub fn new() -> Self {
        let units = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1);
        Self::with_compute_units(units)
    }

    /// Backend reporting a fixed compute-unit count (deterministic WPP
    /// dispatch width in tests).
    pub fn with_compute_units(compute_units: u32) -> Self {
        CpuBackend {
            buffers: Vec::new(),
            images: Vec::new(),
            compute_units: compute_units.max(1),
            built: false,
            dispatches: 0,
        }
    }

    /// Kernel launches executed so far.
    pub fn dispatch_count(&self) -> u64 {
        self.dispatches
    }

    fn buffer_ref(&self, h: BufferHandle) -> Result<&PageBuffer, BackendError> {
        self.buffers
            .get(h.0 as usize)
            .and_then(Option::as_ref)
            .ok_or(BackendError::UnknownHandle { kind: "buffer", id: h.0 })
    }

    fn buffer_mut(&mut self, h: BufferHandle) -> Result<&mut PageBuffer, BackendError> {
        self.buffers
            .get_mut(h.0 as usize)
            .and_then(Option::as_mut)
            .ok_or(BackendError::UnknownHandle { kind: "buffer", id: h.0 })
    }

    fn image_ref(&self, h: ImageHandle) -> Result<&Image<u8>, BackendError> {
        self.images
            .get(h.0 as usize)
            .and_then(Option::as_ref)
            .ok_or(BackendError::UnknownHandle { kind: "image", id: h.0 })
    }

    /// Move a buffer out so a kernel can write it while others are borrowed.
    fn take_buffer(&mut self, h: BufferHandle) -> Result<PageBuffer, BackendError> {
        self.buffers
            .get_mut(h.0 as usize)
            .and_then(Option::take)
            .ok_or(BackendError::UnknownHandle { kind: "buffer", id: h.0 })
    }

    fn put_buffer(&mut self, h: BufferHandle, data: PageBuffer) {
        self.buffers[h.0 as usize] = Some(data);
    }

    fn take_image(&mut self, h: ImageHandle) -> Result<Image<u8>, BackendError> {
        self.images
            .get_mut(h.0 as usize)
            .and_then(Option::take)
            .ok_or(BackendError::UnknownHandle { kind: "image", id: h.0 })
    }

    fn put_image(&mut self, h: ImageHandle, img: Image<u8>) {
        self.images[h.0 as usize] = Some(img);
    }

    fn words(buf: &PageBuffer) -> &[u32] {
        bytemuck::cast_slice(&buf[..])
    }

    fn words_mut(buf: &mut PageBuffer) -> &mut [u32] {
        bytemuck::cast_slice_mut(&mut buf[..])
    }

    fn run_downsample(&mut self, d: &Dispatch) -> Result<(), BackendError> {
        let src_h = d.image(0)?;
        let outs = [d.image(1)?, d.image(2)?, d.image(3)?];
        let mut taken = Vec::with_capacity(3);
        for h in outs {
            match self.take_image(h) {
                Ok(img) => taken.push(img),
                Err(e) => {
                    for (h, img) in outs.iter().zip(taken) {
                        self.put_image(*h, img);
                    }
                    return Err(e);
                }
            }
        }
        let result = match (self.image_ref(src_h), taken.as_mut_slice()) {
            (Ok(src), [d2, d4, d8]) => kernels::downsample(&d.params, d.global, src, [d2, d4, d8]),
            (Err(e), _) => Err(e),
            _ => Err(BackendError::Execution("downsample needs three output levels".into())),
        };
        for (h, img) in outs.iter().zip(taken) {
            self.put_image(*h, img);
        }
        result
    }

    fn run_hme_tier(&mut self, d: &Dispatch) -> Result<(), BackendError> {
        let out_h = d.required_buffer(3)?;
        let mut out = self.take_buffer(out_h)?;
        let result = (|| {
            let src = self.image_ref(d.image(0)?)?;
            let refr = self.image_ref(d.image(1)?)?;
            let pred = match d.buffer(2)? {
                Some(h) => Some(Self::words(self.buffer_ref(h)?)),
                None => None,
            };
            kernels::hme_tier(&d.params, d.groups(), src, refr, pred, Self::words_mut(&mut out))
        })();
        self.put_buffer(out_h, out);
        result
    }

    fn run_refine(&mut self, d: &Dispatch) -> Result<(), BackendError> {
        let out_handles = [d.required_buffer(3)?, d.required_buffer(4)?, d.required_buffer(5)?];
        let board_h = match d.kernel {
            Kernel::RefineWpp => Some(d.required_buffer(6)?),
            _ => None,
        };

        let mut outs = Vec::with_capacity(4);
        for h in out_handles.iter().copied().chain(board_h) {
            match self.take_buffer(h) {
                Ok(b) => outs.push((h, b)),
                Err(e) => {
                    for (h, b) in outs {
                        self.put_buffer(h, b);
                    }
                    return Err(e);
                }
            }
        }

        let result = (|| {
            let src = self.image_ref(d.image(0)?)?;
            let refr = self.image_ref(d.image(1)?)?;
            let pred = Self::words(self.buffer_ref(d.required_buffer(2)?)?);
            let mut slices = outs.iter_mut().map(|(_, b)| Self::words_mut(b));
            let (Some(mvs), Some(residuals), Some(shapes)) = (slices.next(), slices.next(), slices.next())
            else {
                return Err(BackendError::Execution("refine needs three output buffers".into()));
            };
            match slices.next() {
                Some(board) => kernels::refine_wpp(
                    &d.params, d.groups(), src, refr, pred, mvs, residuals, shapes, board,
                ),
                None => kernels::refine(&d.params, d.groups(), src, refr, pred, mvs, residuals, shapes),
            }
        })();

        for (h, b) in outs {
            self.put_buffer(h, b);
        }
        result
    }
}

impl ComputeBackend for CpuBackend {
    fn name(&self) -> String {
        format!("host reference ({} compute units)", self.compute_units)
    }

    fn supports_motion_estimation(&self) -> bool {
        true
    }

    fn compute_units(&self) -> u32 {
        self.compute_units
    }

    fn build_kernels(&mut self) -> Result<(), BackendError> {
        self.built = true;
        debug!("host kernels ready");
        Ok(())
    }

    fn create_buffer(&mut self, bytes: usize) -> Result<BufferHandle, BackendError> {
        let handle = BufferHandle(claim_slot(&mut self.buffers, page_buffer(bytes)));
        trace!(id = handle.0, bytes, "create_buffer");
        Ok(handle)
    }

    fn create_image(&mut self, width: u32, height: u32) -> Result<ImageHandle, BackendError> {
        let handle = ImageHandle(claim_slot(&mut self.images, Image::new(width as usize, height as usize)));
        trace!(id = handle.0, width, height, "create_image");
        Ok(handle)
    }

    fn release_buffer(&mut self, handle: BufferHandle) {
        if let Some(slot) = self.buffers.get_mut(handle.0 as usize) {
            *slot = None;
        }
    }

    fn release_image(&mut self, handle: ImageHandle) {
        if let Some(slot) = self.images.get_mut(handle.0 as usize) {
            *slot = None;
        }
    }

    fn write_image(&mut self, handle: ImageHandle, pixels: &[u8]) -> Result<(), BackendError> {
        let img = self
            .images
            .get_mut(handle.0 as usize)
            .and_then(Option::as_mut)
            .ok_or(BackendError::UnknownHandle { kind: "image", id: handle.0 })?;
        let expected = img.width() * img.height();
        if pixels.len() != expected {
            return Err(BackendError::SizeMismatch { expected, actual: pixels.len() });
        }
        let w = img.width();
        for (y, row) in pixels.chunks_exact(w.max(1)).enumerate().take(img.height()) {
            img.row_mut(y).copy_from_slice(row);
        }
        Ok(())
    }

    fn write_buffer(&mut self, handle: BufferHandle, words: &[u32]) -> Result<(), BackendError> {
        let buf = self.buffer_mut(handle)?;
        let dst = Self::words_mut(buf);
        if words.len() > dst.len() {
            return Err(BackendError::SizeMismatch { expected: dst.len() * 4, actual: words.len() * 4 });
        }
        dst[..words.len()].copy_from_slice(words);
        Ok(())
    }

    fn zero_buffer(&mut self, handle: BufferHandle) -> Result<(), BackendError> {
        self.buffer_mut(handle)?.fill(0);
        Ok(())
    }

    fn enqueue_kernel(&mut self, dispatch: &Dispatch) -> Result<(), BackendError> {
        if !self.built {
            return Err(BackendError::Execution("kernels not built".into()));
        }
        dispatch.validate()?;
        trace!(kernel = %dispatch.kernel, global = ?dispatch.global, "enqueue");
        match dispatch.kernel {
            Kernel::Downsample => self.run_downsample(dispatch)?,
            Kernel::HmeTier => self.run_hme_tier(dispatch)?,
            Kernel::Refine | Kernel::RefineWpp => self.run_refine(dispatch)?,
        }
        self.dispatches += 1;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), BackendError> {
        Ok(())
    }

    fn finish(&mut self) -> Result<(), BackendError> {
        Ok(())
    }

    fn read_buffer(&mut self, handle: BufferHandle, count: usize) -> Result<Vec<u32>, BackendError> {
        let words = Self::words(self.buffer_ref(handle)?);
        if count > words.len() {
            return Err(BackendError::SizeMismatch { expected: count * 4, actual: words.len() * 4 });
        }
        Ok(words[..count].to_vec())
    }

    fn read_image(&mut self, handle: ImageHandle) -> Result<Vec<u8>, BackendError> {
        let img = self.image_ref(handle)?;
        let mut out = Vec::with_capacity(img.width() * img.height());
        for y in 0..img.height() {
            out.extend_from_slice(img.row(y));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{KernelArg, KernelParams};

    #[test]
    fn test_buffers_are_page_aligned_and_zeroed() {
        let mut cpu = CpuBackend::new();
        let h = cpu.create_buffer(10).unwrap();
        let buf = cpu.buffer_ref(h).unwrap();
        assert_eq!(buf.len(), PAGE_SIZE);
        assert_eq!(buf.as_ptr() as usize % PAGE_SIZE, 0);
        assert!(cpu.read_buffer(h, 1024).unwrap().iter().all(|&w| w == 0));
    }

    #[test]
    fn test_write_read_buffer_and_zero() {
        let mut cpu = CpuBackend::new();
        let h = cpu.create_buffer(64).unwrap();
        cpu.write_buffer(h, &[1, 2, 3]).unwrap();
        assert_eq!(cpu.read_buffer(h, 4).unwrap(), vec![1, 2, 3, 0]);
        cpu.zero_buffer(h).unwrap();
        assert_eq!(cpu.read_buffer(h, 3).unwrap(), vec![0, 0, 0]);
    }

    #[test]
    fn test_image_round_trip_and_size_check() {
        let mut cpu = CpuBackend::new();
        let h = cpu.create_image(3, 2).unwrap();
        cpu.write_image(h, &[1, 2, 3, 4, 5, 6]).unwrap();
        assert_eq!(cpu.read_image(h).unwrap(), vec![1, 2, 3, 4, 5, 6]);
        assert!(matches!(
            cpu.write_image(h, &[0; 5]),
            Err(BackendError::SizeMismatch { expected: 6, actual: 5 })
        ));
    }

    #[test]
    fn test_unknown_and_released_handles() {
        let mut cpu = CpuBackend::new();
        assert!(matches!(
            cpu.read_buffer(BufferHandle(7), 1),
            Err(BackendError::UnknownHandle { kind: "buffer", id: 7 })
        ));
        let h = cpu.create_image(2, 2).unwrap();
        cpu.release_image(h);
        assert!(cpu.read_image(h).is_err());
    }

    #[test]
    fn test_released_slots_are_reused() {
        let mut cpu = CpuBackend::new();
        let a = cpu.create_buffer(64).unwrap();
        let b = cpu.create_buffer(64).unwrap();
        cpu.release_buffer(a);
        cpu.release_buffer(b);
        // Reallocating the same set must not grow the table.
        let c = cpu.create_buffer(128).unwrap();
        let d = cpu.create_buffer(128).unwrap();
        assert_eq!(c, a);
        assert_eq!(d, b);
        assert_eq!(cpu.buffers.len(), 2);
        assert_eq!(cpu.read_buffer(c, 32).unwrap(), vec![0; 32]);

        let i = cpu.create_image(4, 4).unwrap();
        cpu.release_image(i);
        assert_eq!(cpu.create_image(8, 2).unwrap(), i);
        assert_eq!(cpu.images.len(), 1);
    }

    #[test]
    fn test_enqueue_requires_build() {
        let mut cpu = CpuBackend::new();
        let src = cpu.create_image(16, 16).unwrap();
        let lv: Vec<_> = [(8, 8), (4, 4), (2, 2)]
            .iter()
            .map(|&(w, h)| cpu.create_image(w, h).unwrap())
            .collect();
        let d = Dispatch {
            kernel: Kernel::Downsample,
            global: [16, 1],
            local: [16, 1],
            args: vec![
                KernelArg::Image(src),
                KernelArg::Image(lv[0]),
                KernelArg::Image(lv[1]),
                KernelArg::Image(lv[2]),
            ],
            params: KernelParams { width: 16, height: 16, ..KernelParams::default() },
        };
        assert!(cpu.enqueue_kernel(&d).is_err());
        cpu.build_kernels().unwrap();
        cpu.write_image(src, &[100; 256]).unwrap();
        cpu.enqueue_kernel(&d).unwrap();
        cpu.finish().unwrap();
        assert_eq!(cpu.read_image(lv[2]).unwrap(), vec![100; 4]);
        assert_eq!(cpu.dispatch_count(), 1);
    }

    #[test]
    fn test_failed_dispatch_keeps_resources() {
        let mut cpu = CpuBackend::new();
        cpu.build_kernels().unwrap();
        let src = cpu.create_image(16, 16).unwrap();
        let small = cpu.create_image(1, 1).unwrap();
        let d = Dispatch {
            kernel: Kernel::Downsample,
            global: [16, 1],
            local: [16, 1],
            args: vec![
                KernelArg::Image(src),
                KernelArg::Image(small),
                KernelArg::Image(ImageHandle(99)),
                KernelArg::Image(small),
            ],
            params: KernelParams { width: 16, height: 16, ..KernelParams::default() },
        };
        // Aliased output is rejected before anything is taken.
        assert!(cpu.enqueue_kernel(&d).is_err());
        assert!(cpu.read_image(small).is_ok());
    }
}
