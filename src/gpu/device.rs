// gpu/device.rs — wgpu adapter/device acquisition and the capability gate.
//
// Responsibilities:
//   - Enumerate adapters and select the first hardware one.
//   - Expose a `DeviceProfile` for simulating a small device's limits on a
//     development machine.
//   - Validate the kernels' work-group shape against the active limits.
//   - Answer the single capability question the driver asks:
//     can this device run the motion-estimation kernels at all?
//
// ADAPTER SELECTION
// ─────────────────
// wgpu's default `request_adapter` may pick a software rasterizer
// (llvmpipe, WARP) when one is present. We enumerate explicitly and prefer
// real hardware, falling back to whatever exists only as a last resort.
//
// DEVICE LIMITS
// ─────────────
// Under a non-Native profile we request *lower* limits than the hardware
// supports. wgpu validates every dispatch against the requested limits, so
// a kernel that would be rejected on the small device is rejected here too.
//
// CAPABILITY GATE
// ───────────────
// The pipeline needs compute shaders, five storage buffers and three
// write-only storage textures in one stage (refine_wpp / downsample), and
// 16-wide work groups. Anything less is reported as `Unsupported`, which
// the driver turns into a skipped run rather than a failure.
//
// NEW RUST CONCEPTS
// ─────────────────
// - `pollster::block_on` — runs an async fn to completion on the current
//   thread. wgpu's adapter/device API is async because on WebGPU it maps to
//   JS promises; natively we just block.
// - Struct field drop order — fields drop top to bottom, so `_instance` is
//   declared last and outlives the device and queue.

use std::fmt;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::align::SIMD_SIZE;
use crate::error::BackendError;

/// Storage buffers bound by the widest kernel (refine_wpp).
const REQUIRED_STORAGE_BUFFERS: u32 = 5;

/// Write-only storage textures bound by downsample.
const REQUIRED_STORAGE_TEXTURES: u32 = 3;

/// Hardware profile controlling the requested device limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceProfile {
    /// The adapter's own limits.
    #[default]
    Native,
    /// Simulate a low-power mobile GPU: 256 invocations per work group,
    /// 4096² textures, 128 MiB storage bindings.
    LowPower,
}

impl fmt::Display for DeviceProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceProfile::Native => write!(f, "Native"),
            DeviceProfile::LowPower => write!(f, "LowPower (simulated limits)"),
        }
    }
}

/// Work-group shape of every kernel: one SIMD row of 16 invocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkgroupSize {
    pub x: u32,
    pub y: u32,
}

impl WorkgroupSize {
    pub const KERNEL: WorkgroupSize = WorkgroupSize { x: SIMD_SIZE, y: 1 };

    pub fn total(&self) -> u32 {
        self.x * self.y
    }

    /// Substitute the `{{WG_X}}` / `{{WG_Y}}` tokens of a shader template.
    pub fn specialise(&self, template: &str) -> String {
        template
            .replace("{{WG_X}}", &self.x.to_string())
            .replace("{{WG_Y}}", &self.y.to_string())
    }
}

impl fmt::Display for WorkgroupSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}×{} ({} invocations)", self.x, self.y, self.total())
    }
}

/// Cached adapter information for logging.
#[derive(Debug, Clone)]
pub struct AdapterInfo {
    pub name: String,
    pub vendor: u32,
    pub device: u32,
    pub device_type: wgpu::DeviceType,
    pub backend: wgpu::Backend,
}

impl fmt::Display for AdapterInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?}, {:?})", self.name, self.backend, self.device_type)
    }
}

/// Errors from adapter and device acquisition.
#[derive(Error, Debug)]
pub enum GpuError {
    #[error("no GPU adapter found")]
    NoSuitableAdapter,

    #[error("device request failed: {0}")]
    DeviceRequest(#[from] wgpu::RequestDeviceError),

    #[error("work group of {total} invocations exceeds the limit of {max}")]
    WorkgroupTooLarge { total: u32, max: u32 },
}

impl From<GpuError> for BackendError {
    fn from(e: GpuError) -> Self {
        match e {
            GpuError::NoSuitableAdapter | GpuError::WorkgroupTooLarge { .. } => {
                BackendError::Unsupported(e.to_string())
            }
            GpuError::DeviceRequest(_) => BackendError::Device(e.to_string()),
        }
    }
}

/// The GPU context: device, queue, active profile and what the adapter
/// reported about itself.
pub struct GpuDevice {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub profile: DeviceProfile,
    pub adapter_info: AdapterInfo,
    /// Limits actually granted by `request_device`.
    pub limits: wgpu::Limits,
    pub downlevel: wgpu::DownlevelCapabilities,
    // Declared last: outlives `device` and `queue`.
    _instance: wgpu::Instance,
}

impl GpuDevice {
    /// First hardware adapter with `DeviceProfile::Native` limits.
    pub fn new() -> Result<Self, GpuError> {
        Self::new_with_profile(DeviceProfile::Native)
    }

    pub fn new_with_profile(profile: DeviceProfile) -> Result<Self, GpuError> {
        pollster::block_on(Self::init_async(profile))
    }

    async fn init_async(profile: DeviceProfile) -> Result<Self, GpuError> {
        let flags = if cfg!(debug_assertions) {
            wgpu::InstanceFlags::VALIDATION
        } else {
            wgpu::InstanceFlags::empty()
        };
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::PRIMARY,
            flags,
            ..Default::default()
        });

        let adapters = instance.enumerate_adapters(wgpu::Backends::PRIMARY);
        for a in &adapters {
            let info = a.get_info();
            debug!(name = %info.name, backend = ?info.backend, kind = ?info.device_type, "adapter");
        }

        //   DiscreteGpu / IntegratedGpu / VirtualGpu / Other  <- take first
        //   Cpu (software rasterizer)                         <- last resort
        let mut hardware = None;
        let mut software = None;
        for a in adapters {
            if a.get_info().device_type == wgpu::DeviceType::Cpu {
                software.get_or_insert(a);
            } else if hardware.is_none() {
                hardware = Some(a);
            }
        }
        let adapter = match (hardware, software) {
            (Some(a), _) => a,
            (None, Some(a)) => {
                warn!(name = %a.get_info().name, "only a software adapter is available");
                a
            }
            (None, None) => return Err(GpuError::NoSuitableAdapter),
        };

        let raw = adapter.get_info();
        let adapter_info = AdapterInfo {
            name: raw.name.clone(),
            vendor: raw.vendor,
            device: raw.device,
            device_type: raw.device_type,
            backend: raw.backend,
        };
        let downlevel = adapter.get_downlevel_capabilities();

        let (device, queue): (wgpu::Device, wgpu::Queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("pyramid-me"),
                    required_features: wgpu::Features::empty(),
                    required_limits: limits_for_profile(profile, &adapter.limits()),
                    memory_hints: wgpu::MemoryHints::Performance,
                },
                None,
            )
            .await?;
        let limits = device.limits();

        info!(adapter = %adapter_info, %profile, "GPU device ready");

        Ok(GpuDevice {
            device,
            queue,
            profile,
            adapter_info,
            limits,
            downlevel,
            _instance: instance,
        })
    }

    /// Check a work-group shape against the granted limits.
    pub fn validate_workgroup(&self, wg: WorkgroupSize) -> Result<(), GpuError> {
        let max = self.limits.max_compute_invocations_per_workgroup;
        if wg.total() > max || wg.x > self.limits.max_compute_workgroup_size_x {
            return Err(GpuError::WorkgroupTooLarge { total: wg.total(), max });
        }
        Ok(())
    }

    /// Why this device cannot run the pipeline, if it cannot.
    pub fn unsupported_reason(&self) -> Option<String> {
        missing_capability(&self.limits, &self.downlevel)
    }
}

impl fmt::Display for GpuDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GpuDevice {{ adapter: {}, profile: {} }}", self.adapter_info, self.profile)
    }
}

// ============================================================
// Limits helpers
// ============================================================

/// Limits to request for `profile`. Native asks for the adapter's own
/// limits so large frames are not capped by wgpu's portable defaults.
fn limits_for_profile(profile: DeviceProfile, adapter: &wgpu::Limits) -> wgpu::Limits {
    match profile {
        DeviceProfile::Native => adapter.clone(),
        DeviceProfile::LowPower => wgpu::Limits {
            max_compute_invocations_per_workgroup: 256,
            max_compute_workgroup_size_x: 256,
            max_compute_workgroup_size_y: 256,
            max_compute_workgroup_size_z: 64,
            max_texture_dimension_2d: 4096,
            max_storage_buffer_binding_size: 128 << 20,
            ..wgpu::Limits::default()
        },
    }
}

fn missing_capability(limits: &wgpu::Limits, downlevel: &wgpu::DownlevelCapabilities) -> Option<String> {
    if !downlevel.flags.contains(wgpu::DownlevelFlags::COMPUTE_SHADERS) {
        return Some("compute shaders not available".into());
    }
    if limits.max_storage_buffers_per_shader_stage < REQUIRED_STORAGE_BUFFERS {
        return Some(format!(
            "{} storage buffers per stage, need {REQUIRED_STORAGE_BUFFERS}",
            limits.max_storage_buffers_per_shader_stage
        ));
    }
    if limits.max_storage_textures_per_shader_stage < REQUIRED_STORAGE_TEXTURES {
        return Some(format!(
            "{} storage textures per stage, need {REQUIRED_STORAGE_TEXTURES}",
            limits.max_storage_textures_per_shader_stage
        ));
    }
    if limits.max_compute_invocations_per_workgroup < WorkgroupSize::KERNEL.total() {
        return Some(format!(
            "{} invocations per work group, need {}",
            limits.max_compute_invocations_per_workgroup,
            WorkgroupSize::KERNEL.total()
        ));
    }
    None
}

// ============================================================
// Tests
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kernel_workgroup_shape() {
        assert_eq!(WorkgroupSize::KERNEL.total(), 16);
        let src = WorkgroupSize::KERNEL.specialise("@workgroup_size({{WG_X}}, {{WG_Y}}, 1)");
        assert_eq!(src, "@workgroup_size(16, 1, 1)");
    }

    #[test]
    fn test_low_power_limits_cap_invocations() {
        let limits = limits_for_profile(DeviceProfile::LowPower, &wgpu::Limits::default());
        assert_eq!(limits.max_compute_invocations_per_workgroup, 256);
        assert_eq!(limits.max_texture_dimension_2d, 4096);
    }

    #[test]
    fn test_native_limits_follow_adapter() {
        let adapter = wgpu::Limits { max_texture_dimension_2d: 16384, ..wgpu::Limits::default() };
        assert_eq!(limits_for_profile(DeviceProfile::Native, &adapter), adapter);
    }

    #[test]
    fn test_capability_gate() {
        let caps = wgpu::DownlevelCapabilities::default();
        assert_eq!(missing_capability(&wgpu::Limits::default(), &caps), None);

        let no_compute = wgpu::DownlevelCapabilities {
            flags: wgpu::DownlevelFlags::empty(),
            ..wgpu::DownlevelCapabilities::default()
        };
        assert!(missing_capability(&wgpu::Limits::default(), &no_compute).is_some());

        // WebGL2-class limits have no storage buffers at all.
        let reason = missing_capability(&wgpu::Limits::downlevel_webgl2_defaults(), &caps);
        assert!(reason.is_some_and(|r| r.contains("storage buffers")));
    }

    #[test]
    fn test_adapter_errors_map_to_unsupported() {
        let e: BackendError = GpuError::NoSuitableAdapter.into();
        assert!(matches!(e, BackendError::Unsupported(_)));
        let e: BackendError = GpuError::WorkgroupTooLarge { total: 512, max: 256 }.into();
        assert!(matches!(e, BackendError::Unsupported(_)));
    }

    // ---- GPU integration tests (subprocess isolation) -------------------------
    //
    // Some Vulkan layers crash during process exit once a device has been
    // created. Each real GPU test runs in a child process that prints
    // "GPU_TEST_OK" just before returning; the parent checks for that token
    // and ignores the child's exit status.

    fn run_gpu_test_in_subprocess(test_name: &str) -> String {
        let output = std::process::Command::new("cargo")
            .args(["test", "--lib", "--", test_name, "--exact", "--ignored", "--nocapture"])
            .output()
            .unwrap_or_else(|e| panic!("failed to spawn subprocess for {test_name}: {e}"));
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        print!("{stdout}");
        eprint!("{stderr}");
        stdout + &stderr
    }

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_gpu_device_init_native() {
        let gpu = GpuDevice::new().expect("should initialise a GPU device");
        println!("{gpu}");
        assert!(gpu.validate_workgroup(WorkgroupSize::KERNEL).is_ok());
        assert_eq!(gpu.unsupported_reason(), None);
        println!("GPU_TEST_OK");
    }

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_gpu_device_low_power_rejects_large_group() {
        let gpu = GpuDevice::new_with_profile(DeviceProfile::LowPower).unwrap();
        assert_eq!(gpu.profile, DeviceProfile::LowPower);
        let err = gpu.validate_workgroup(WorkgroupSize { x: 16, y: 17 }).unwrap_err();
        assert!(matches!(err, GpuError::WorkgroupTooLarge { total: 272, max: 256 }));
        println!("GPU_TEST_OK");
    }

    #[test]
    #[ignore = "requires a real GPU"]
    fn test_gpu_device_init_native() {
        let out = run_gpu_test_in_subprocess("gpu::device::tests::inner_gpu_device_init_native");
        assert!(out.contains("GPU_TEST_OK"), "inner test did not print GPU_TEST_OK:\n{out}");
    }

    #[test]
    #[ignore = "requires a real GPU"]
    fn test_gpu_device_low_power_rejects_large_group() {
        let out = run_gpu_test_in_subprocess(
            "gpu::device::tests::inner_gpu_device_low_power_rejects_large_group",
        );
        assert!(out.contains("GPU_TEST_OK"), "inner test did not print GPU_TEST_OK:\n{out}");
    }
}
