//! Device seam: the operations the pool and program cache need from a GPU.
//!
//! `GpuContext` implements this for wgpu. Unit tests substitute counting
//! mocks so allocator and cache behavior can be verified without hardware.

use crate::error::GpuResult;
use crate::program::ProgramDescriptor;

/// Buffer usage classes the pool distinguishes.
///
/// Pooled buffers are keyed by (bucket size, class); a recycled buffer always
/// carries the usage flags of its class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UsageClass {
    /// Kernel inputs and outputs: `STORAGE | COPY_SRC | COPY_DST`.
    Storage,
    /// Shader parameter blocks: `UNIFORM | COPY_DST`.
    Uniform,
    /// Host-to-device staging: `MAP_WRITE | COPY_SRC`.
    Upload,
}

/// Raw device operations behind the allocator and the program cache.
pub trait DeviceBacking {
    type Buffer;
    type Pipeline;

    /// Create a device buffer of exactly `size` bytes for the given class.
    /// Device-level allocation failure propagates as a hard error.
    fn create_buffer(&self, size: u64, class: UsageClass) -> GpuResult<Self::Buffer>;

    /// Destroy a device buffer immediately.
    fn destroy_buffer(&self, buffer: Self::Buffer);

    /// Compile a program descriptor into an executable pipeline.
    fn compile(&self, desc: &ProgramDescriptor) -> GpuResult<Self::Pipeline>;
}
