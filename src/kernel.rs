//! Kernel abstraction: operators describe their GPU work as a plan, the
//! engine executes it.
//!
//! Kernels are pure with respect to the engine. They never touch the device;
//! they validate inputs and return a shader-source generator, workgroup
//! counts, uniform values, and output specs. That separation lets the program
//! cache and dispatcher be exercised without any real kernel, and lets
//! kernels be tested as shape/shader-text generators.

use crate::error::GpuResult;
use crate::kernels;
use crate::pool::BufferHandle;
use crate::program::{ProgramDescriptor, UniformValues};

/// Element type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    F32,
    F16,
    U32,
    I32,
}

impl DataType {
    pub fn size(self) -> usize {
        match self {
            Self::F32 | Self::U32 | Self::I32 => 4,
            Self::F16 => 2,
        }
    }

    /// WGSL scalar type name.
    pub(crate) fn wgsl(self) -> &'static str {
        match self {
            Self::F32 => "f32",
            Self::F16 => "f16",
            Self::U32 => "u32",
            Self::I32 => "i32",
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, Self::F32 | Self::F16)
    }
}

/// A tensor as seen by kernels: dtype, shape, and the pooled buffer holding
/// its elements.
#[derive(Debug, Clone)]
pub struct TensorDesc {
    pub dtype: DataType,
    pub shape: Vec<usize>,
    pub buffer: BufferHandle,
}

impl TensorDesc {
    pub fn element_count(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn byte_size(&self) -> u64 {
        (self.element_count() * self.dtype.size()) as u64
    }
}

/// Output tensor requested by a plan. `alias_of` points at an input whose
/// buffer the output reuses instead of allocating a fresh one.
#[derive(Debug, Clone)]
pub struct OutputSpec {
    pub dtype: DataType,
    pub shape: Vec<usize>,
    pub alias_of: Option<usize>,
}

/// Everything the engine needs to run one kernel invocation.
pub struct KernelPlan {
    /// Distinguishes pipelines that embed different shapes as compile-time
    /// constants.
    pub shape_hint: String,
    /// Whether the dispatch is effectively one-dimensional.
    pub one_dim: bool,
    /// Deferred shader construction; only invoked on a program-cache miss.
    pub shader: Box<dyn FnOnce() -> ProgramDescriptor>,
    pub workgroups: [u32; 3],
    pub uniforms: UniformValues,
    pub outputs: Vec<OutputSpec>,
}

impl std::fmt::Debug for KernelPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelPlan")
            .field("shape_hint", &self.shape_hint)
            .field("one_dim", &self.one_dim)
            .field("shader", &"<fn>")
            .field("workgroups", &self.workgroups)
            .field("uniforms", &self.uniforms)
            .field("outputs", &self.outputs)
            .finish()
    }
}

/// A compute operator. Implementations validate their inputs (rank, dtype,
/// broadcastability) before anything is allocated or dispatched.
pub trait Kernel {
    fn name(&self) -> &'static str;
    fn plan(&self, inputs: &[TensorDesc]) -> GpuResult<KernelPlan>;
}

/// The closed set of built-in operators. Resolution is an exhaustive match,
/// so an unhandled operator is a compile error rather than a runtime lookup
/// failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Copy,
    Neg,
    Relu,
    Add,
    Mul,
}

impl OpKind {
    pub fn kernel(self) -> &'static dyn Kernel {
        match self {
            OpKind::Copy => &kernels::elementwise::Copy,
            OpKind::Neg => &kernels::elementwise::Neg,
            OpKind::Relu => &kernels::elementwise::Relu,
            OpKind::Add => &kernels::binary::Add,
            OpKind::Mul => &kernels::binary::Mul,
        }
    }
}
