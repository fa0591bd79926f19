// gpu/backend.rs — `ComputeBackend` on wgpu compute pipelines.
//
// QUEUE MODEL
// ───────────
// Everything the pipeline asks for is recorded into one pending
// `CommandEncoder`: staging copies for uploads, `clear_buffer` for zeroing,
// and one compute pass per kernel launch. `flush()` submits the encoder,
// `finish()` submits and waits. Recording everything into the same encoder
// keeps uploads, clears and kernels in exactly the order they were issued;
// `Queue::write_*` would jump ahead of work already recorded.
//
// BINDINGS
// ────────
// One bind group layout per kernel, mirroring the @group(0) declarations of
// its shader. Bind groups and the 64-byte params uniform are created per
// launch; they are cheap next to the dispatch itself.
//
//   downsample   0 src  1-3 levels (storage write)          4 params
//   hme_tier     0 src  1 ref  2 pred_in  3 pred_out        4 params
//   refine       0 src  1 ref  2 pred  3 mvs  4 res  5 shape 6 params
//   refine_wpp   refine + 7 scoreboard (atomic)
//
// An absent optional buffer (`KernelArg::Null`) binds a small placeholder
// and clears the `has_pred` word of the params block.
//
// DEVICE ERRORS
// ─────────────
// Opening the pending encoder pushes a Validation and an OutOfMemory error
// scope; `flush()` pops both after submitting. Anything wgpu reports outside
// a scope (uncaptured errors, device loss) lands in `DeviceFaults`, which
// `flush()` and `finish()` drain. Either way the call returns
// `BackendError::Execution` and the run fails.
//
// NEW RUST CONCEPTS
// ─────────────────
// - `Option::take` on the pending encoder: the encoder is consumed by
//   `finish()`, so it lives in an `Option` and is recreated lazily.
// - `push_error_scope` / `pop_error_scope` — wgpu reports shader and
//   pipeline validation errors asynchronously; a scope turns them into a
//   value we can return as `BackendError::KernelBuild`.

use std::collections::HashMap;
use std::sync::{mpsc, Arc, Mutex, PoisonError};

use tracing::{debug, error, trace};
use wgpu::util::DeviceExt;

use crate::backend::{claim_slot, BufferHandle, ComputeBackend, Dispatch, ImageHandle, Kernel, KernelArg};
use crate::error::BackendError;
use crate::gpu::device::{GpuDevice, WorkgroupSize};
use crate::gpu::image::{narrow_rows, GpuImage};

/// Compute-unit count assumed when the caller does not supply one. wgpu
/// exposes no portable query for it.
pub const DEFAULT_COMPUTE_UNITS: u32 = 16;

const COMMON_WGSL: &str = include_str!("../shaders/common.wgsl");
const DOWNSAMPLE_WGSL: &str = include_str!("../shaders/downsample.wgsl");
const HME_TIER_WGSL: &str = include_str!("../shaders/hme_tier.wgsl");
const REFINE_COMMON_WGSL: &str = include_str!("../shaders/refine_common.wgsl");
const REFINE_WGSL: &str = include_str!("../shaders/refine.wgsl");
const REFINE_WPP_WGSL: &str = include_str!("../shaders/refine_wpp.wgsl");

/// Word of `KernelParams::_pad` that carries the `has_pred` flag.
const HAS_PRED_WORD: usize = 0;

struct GpuBuffer {
    buffer: wgpu::Buffer,
    size: u64,
}

struct KernelPipeline {
    pipeline: wgpu::ComputePipeline,
    layout: wgpu::BindGroupLayout,
}

/// First device error reported through a wgpu callback, kept until the next
/// `flush()` or `finish()` turns it into an `Err`.
#[derive(Clone, Default)]
struct DeviceFaults(Arc<Mutex<Option<String>>>);

impl DeviceFaults {
    fn record(&self, message: String) {
        let mut slot = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        slot.get_or_insert(message);
    }

    fn take(&self) -> Result<(), BackendError> {
        let mut slot = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        match slot.take() {
            Some(message) => Err(BackendError::Execution(message)),
            None => Ok(()),
        }
    }
}

/// wgpu implementation of the compute device.
pub struct WgpuBackend {
    gpu: GpuDevice,
    pipelines: HashMap<Kernel, KernelPipeline>,
    buffers: Vec<Option<GpuBuffer>>,
    images: Vec<Option<GpuImage>>,
    placeholder: wgpu::Buffer,
    encoder: Option<wgpu::CommandEncoder>,
    faults: DeviceFaults,
    compute_units: u32,
    dispatches: u64,
}

// Lookups are free functions over the individual fields so a resource can be
// borrowed while the pending encoder is borrowed mutably.

fn pending<'a>(slot: &'a mut Option<wgpu::CommandEncoder>, device: &wgpu::Device) -> &'a mut wgpu::CommandEncoder {
    slot.get_or_insert_with(|| {
        // Popped by `flush()` once this encoder is submitted.
        device.push_error_scope(wgpu::ErrorFilter::Validation);
        device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        device.create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("pyramid-me") })
    })
}

fn lookup_buffer(buffers: &[Option<GpuBuffer>], h: BufferHandle) -> Result<&GpuBuffer, BackendError> {
    buffers
        .get(h.0 as usize)
        .and_then(Option::as_ref)
        .ok_or(BackendError::UnknownHandle { kind: "buffer", id: h.0 })
}

fn lookup_image(images: &[Option<GpuImage>], h: ImageHandle) -> Result<&GpuImage, BackendError> {
    images
        .get(h.0 as usize)
        .and_then(Option::as_ref)
        .ok_or(BackendError::UnknownHandle { kind: "image", id: h.0 })
}

impl WgpuBackend {
    /// Acquire the first hardware adapter. No adapter is `Unsupported`.
    pub fn new() -> Result<Self, BackendError> {
        Ok(Self::from_device(GpuDevice::new()?))
    }

    pub fn from_device(gpu: GpuDevice) -> Self {
        let faults = DeviceFaults::default();
        let sink = faults.clone();
        gpu.device.on_uncaptured_error(Box::new(move |e| {
            error!(error = %e, "uncaptured wgpu error");
            sink.record(e.to_string());
        }));
        let sink = faults.clone();
        gpu.device.set_device_lost_callback(move |reason, message| {
            // Dropping the backend reports a loss too.
            if matches!(reason, wgpu::DeviceLostReason::Dropped) {
                return;
            }
            error!(?reason, %message, "wgpu device lost");
            sink.record(format!("device lost ({reason:?}): {message}"));
        });
        let placeholder = gpu.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("null argument"),
            size: 16,
            usage: wgpu::BufferUsages::STORAGE,
            mapped_at_creation: false,
        });
        WgpuBackend {
            gpu,
            pipelines: HashMap::new(),
            buffers: Vec::new(),
            images: Vec::new(),
            placeholder,
            encoder: None,
            faults,
            compute_units: DEFAULT_COMPUTE_UNITS,
            dispatches: 0,
        }
    }

    /// Report a fixed compute-unit count (sizes the WPP dispatch).
    pub fn with_compute_units(mut self, compute_units: u32) -> Self {
        self.compute_units = compute_units.max(1);
        self
    }

    pub fn device(&self) -> &GpuDevice {
        &self.gpu
    }

    /// Kernel launches recorded so far.
    pub fn dispatch_count(&self) -> u64 {
        self.dispatches
    }

    // -----------------------------------------------------------------------
    // Pipeline construction
    // -----------------------------------------------------------------------

    fn source(kernel: Kernel) -> String {
        let body = match kernel {
            Kernel::Downsample => DOWNSAMPLE_WGSL.to_string(),
            Kernel::HmeTier => HME_TIER_WGSL.to_string(),
            Kernel::Refine => format!("{REFINE_COMMON_WGSL}\n{REFINE_WGSL}"),
            Kernel::RefineWpp => format!("{REFINE_COMMON_WGSL}\n{REFINE_WPP_WGSL}"),
        };
        WorkgroupSize::KERNEL.specialise(&format!("{COMMON_WGSL}\n{body}"))
    }

    fn layout_entries(kernel: Kernel) -> Vec<wgpu::BindGroupLayoutEntry> {
        let entry = |binding, ty| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty,
            count: None,
        };
        let texture = wgpu::BindingType::Texture {
            multisampled: false,
            view_dimension: wgpu::TextureViewDimension::D2,
            sample_type: wgpu::TextureSampleType::Uint,
        };
        let storage_texture = wgpu::BindingType::StorageTexture {
            access: wgpu::StorageTextureAccess::WriteOnly,
            format: wgpu::TextureFormat::R32Uint,
            view_dimension: wgpu::TextureViewDimension::D2,
        };
        let storage = |read_only| wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        };
        let uniform = wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        };

        match kernel {
            Kernel::Downsample => vec![
                entry(0, texture),
                entry(1, storage_texture),
                entry(2, storage_texture),
                entry(3, storage_texture),
                entry(4, uniform),
            ],
            Kernel::HmeTier => vec![
                entry(0, texture),
                entry(1, texture),
                entry(2, storage(true)),
                entry(3, storage(false)),
                entry(4, uniform),
            ],
            Kernel::Refine | Kernel::RefineWpp => {
                let mut v = vec![
                    entry(0, texture),
                    entry(1, texture),
                    entry(2, storage(true)),
                    entry(3, storage(false)),
                    entry(4, storage(false)),
                    entry(5, storage(false)),
                    entry(6, uniform),
                ];
                if kernel == Kernel::RefineWpp {
                    v.push(entry(7, storage(false)));
                }
                v
            }
        }
    }

    fn build_pipeline(&self, kernel: Kernel) -> Result<KernelPipeline, BackendError> {
        let device = &self.gpu.device;
        device.push_error_scope(wgpu::ErrorFilter::Validation);

        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(kernel.name()),
            source: wgpu::ShaderSource::Wgsl(Self::source(kernel).into()),
        });
        let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some(kernel.name()),
            entries: &Self::layout_entries(kernel),
        });
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some(kernel.name()),
            bind_group_layouts: &[&layout],
            push_constant_ranges: &[],
        });
        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(kernel.name()),
            layout: Some(&pipeline_layout),
            module: &module,
            entry_point: kernel.name(),
            compilation_options: wgpu::PipelineCompilationOptions::default(),
            cache: None,
        });

        if let Some(err) = pollster::block_on(device.pop_error_scope()) {
            return Err(BackendError::KernelBuild { kernel: kernel.name().to_string(), log: err.to_string() });
        }
        Ok(KernelPipeline { pipeline, layout })
    }

    // -----------------------------------------------------------------------
    // Readback
    // -----------------------------------------------------------------------

    /// Submit pending work, wait, and map `buffer` for reading.
    fn map_read(&mut self, buffer: &wgpu::Buffer) -> Result<Vec<u8>, BackendError> {
        self.flush()?;
        let slice = buffer.slice(..);
        let (tx, rx) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |r| {
            let _ = tx.send(r);
        });
        self.gpu.device.poll(wgpu::Maintain::Wait);
        self.faults.take()?;
        rx.recv()
            .map_err(|_| BackendError::Mapping("map callback never fired".into()))?
            .map_err(|e| BackendError::Mapping(e.to_string()))?;
        let bytes = slice.get_mapped_range().to_vec();
        buffer.unmap();
        Ok(bytes)
    }
}

impl ComputeBackend for WgpuBackend {
    fn name(&self) -> String {
        self.gpu.adapter_info.to_string()
    }

    fn supports_motion_estimation(&self) -> bool {
        match self.gpu.unsupported_reason() {
            Some(reason) => {
                debug!(%reason, "device cannot run motion estimation");
                false
            }
            None => self.gpu.validate_workgroup(WorkgroupSize::KERNEL).is_ok(),
        }
    }

    fn compute_units(&self) -> u32 {
        self.compute_units
    }

    fn build_kernels(&mut self) -> Result<(), BackendError> {
        for kernel in Kernel::ALL {
            if self.pipelines.contains_key(&kernel) {
                continue;
            }
            let p = self.build_pipeline(kernel)?;
            debug!(kernel = %kernel, "pipeline built");
            self.pipelines.insert(kernel, p);
        }
        Ok(())
    }

    fn create_buffer(&mut self, bytes: usize) -> Result<BufferHandle, BackendError> {
        let size = (bytes.max(4) as u64).next_multiple_of(4);
        let buffer = self.gpu.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("pyramid-me buffer"),
            size,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let handle = BufferHandle(claim_slot(&mut self.buffers, GpuBuffer { buffer, size }));
        trace!(id = handle.0, bytes = size, "create_buffer");
        Ok(handle)
    }

    fn create_image(&mut self, width: u32, height: u32) -> Result<ImageHandle, BackendError> {
        let image = GpuImage::new(&self.gpu.device, width, height);
        let handle = ImageHandle(claim_slot(&mut self.images, image));
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
        let img = lookup_image(&self.images, handle)?;
        let device = &self.gpu.device;
        img.record_upload(device, pending(&mut self.encoder, device), pixels)
    }

    fn write_buffer(&mut self, handle: BufferHandle, words: &[u32]) -> Result<(), BackendError> {
        let dst = lookup_buffer(&self.buffers, handle)?;
        let bytes = (words.len() * 4) as u64;
        if bytes > dst.size {
            return Err(BackendError::SizeMismatch { expected: dst.size as usize, actual: bytes as usize });
        }
        if words.is_empty() {
            return Ok(());
        }
        let device = &self.gpu.device;
        let staging = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("write_buffer staging"),
            contents: bytemuck::cast_slice(words),
            usage: wgpu::BufferUsages::COPY_SRC,
        });
        pending(&mut self.encoder, device).copy_buffer_to_buffer(&staging, 0, &dst.buffer, 0, bytes);
        Ok(())
    }

    fn zero_buffer(&mut self, handle: BufferHandle) -> Result<(), BackendError> {
        let dst = lookup_buffer(&self.buffers, handle)?;
        pending(&mut self.encoder, &self.gpu.device).clear_buffer(&dst.buffer, 0, None);
        Ok(())
    }

    fn enqueue_kernel(&mut self, d: &Dispatch) -> Result<(), BackendError> {
        d.validate()?;
        let kernel = d.kernel;
        let Some(p) = self.pipelines.get(&kernel) else {
            return Err(BackendError::Execution(format!("kernel '{kernel}' used before build_kernels")));
        };

        let mut params = d.params;
        params._pad[HAS_PRED_WORD] = 0;

        // Resolve every argument before anything is recorded.
        let mut views: Vec<(u32, &wgpu::TextureView)> = Vec::with_capacity(4);
        let mut buffers: Vec<(u32, &wgpu::Buffer)> = Vec::with_capacity(5);
        for (i, arg) in d.args.iter().enumerate() {
            let binding = if kernel == Kernel::RefineWpp && i == 6 { 7 } else { i as u32 };
            match *arg {
                KernelArg::Image(h) => {
                    let img = lookup_image(&self.images, h)?;
                    if kernel == Kernel::Downsample && i > 0 {
                        let f = 2u32 << (i - 1);
                        let (need_w, need_h) = (params.width.div_ceil(f), params.height.div_ceil(f));
                        if img.width < need_w || img.height < need_h {
                            return Err(BackendError::InvalidArgument {
                                kernel: kernel.name(),
                                reason: format!(
                                    "{f}x level is {}x{}, needs {need_w}x{need_h}",
                                    img.width, img.height
                                ),
                            });
                        }
                    }
                    views.push((binding, &img.view));
                }
                KernelArg::Buffer(h) => {
                    buffers.push((binding, &lookup_buffer(&self.buffers, h)?.buffer));
                    if kernel == Kernel::HmeTier && i == 2 {
                        params._pad[HAS_PRED_WORD] = 1;
                    }
                }
                KernelArg::Null => buffers.push((binding, &self.placeholder)),
            }
        }

        let device = &self.gpu.device;
        let params_buf = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("KernelParams"),
            contents: bytemuck::bytes_of(&params),
            usage: wgpu::BufferUsages::UNIFORM,
        });
        let params_binding = match kernel {
            Kernel::Downsample | Kernel::HmeTier => 4,
            Kernel::Refine | Kernel::RefineWpp => 6,
        };

        let mut entries = Vec::with_capacity(d.args.len() + 1);
        for &(binding, view) in &views {
            entries.push(wgpu::BindGroupEntry { binding, resource: wgpu::BindingResource::TextureView(view) });
        }
        for &(binding, buffer) in &buffers {
            entries.push(wgpu::BindGroupEntry { binding, resource: buffer.as_entire_binding() });
        }
        entries.push(wgpu::BindGroupEntry { binding: params_binding, resource: params_buf.as_entire_binding() });

        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(kernel.name()),
            layout: &p.layout,
            entries: &entries,
        });
        let [gx, gy] = d.groups();
        trace!(kernel = %kernel, groups = ?[gx, gy], "enqueue");

        {
            let encoder = pending(&mut self.encoder, device);
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(kernel.name()),
                timestamp_writes: None,
            });
            pass.set_pipeline(&p.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(gx, gy, 1);
        }
        self.dispatches += 1;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), BackendError> {
        if let Some(encoder) = self.encoder.take() {
            let device = &self.gpu.device;
            self.gpu.queue.submit(std::iter::once(encoder.finish()));
            // Reverse push order: OutOfMemory sits on top.
            let oom = pollster::block_on(device.pop_error_scope());
            let validation = pollster::block_on(device.pop_error_scope());
            if let Some(e) = oom.or(validation) {
                error!(error = %e, "submission rejected");
                return Err(BackendError::Execution(e.to_string()));
            }
        }
        self.faults.take()
    }

    fn finish(&mut self) -> Result<(), BackendError> {
        self.flush()?;
        let idle = self.gpu.device.poll(wgpu::Maintain::Wait).is_queue_empty();
        trace!(idle, "finish");
        self.faults.take()
    }

    fn read_buffer(&mut self, handle: BufferHandle, count: usize) -> Result<Vec<u32>, BackendError> {
        let src = lookup_buffer(&self.buffers, handle)?;
        let bytes = (count * 4) as u64;
        if bytes > src.size {
            return Err(BackendError::SizeMismatch { expected: bytes as usize, actual: src.size as usize });
        }
        if count == 0 {
            return Ok(Vec::new());
        }
        let device = &self.gpu.device;
        let readback = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("read_buffer"),
            size: bytes,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        pending(&mut self.encoder, device).copy_buffer_to_buffer(&src.buffer, 0, &readback, 0, bytes);
        let raw = self.map_read(&readback)?;
        Ok(raw.chunks_exact(4).map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]])).collect())
    }

    fn read_image(&mut self, handle: ImageHandle) -> Result<Vec<u8>, BackendError> {
        let img = lookup_image(&self.images, handle)?;
        let (width, height) = (img.width, img.height);
        let device = &self.gpu.device;
        let readback = img.record_readback(device, pending(&mut self.encoder, device));
        let raw = self.map_read(&readback)?;
        Ok(narrow_rows(&raw, width, height))
    }
}
