// gpu/mod.rs — wgpu implementation of `ComputeBackend`.
//
// The host reference kernels in kernels.rs are authoritative; every WGSL
// entry point under src/shaders/ reproduces them bit for bit, and the GPU
// tests compare the two backends output for output.
//
//   device.rs    adapter/device acquisition, limits, the capability gate
//   image.rs     8-bit images stored as R32Uint storage textures
//   backend.rs   WgpuBackend: pipelines, bind groups, queue, readback

pub mod backend;
pub mod device;
pub mod image;

pub use backend::WgpuBackend;
pub use device::GpuDevice;
