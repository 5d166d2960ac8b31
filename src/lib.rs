//! gpurt: a minimal GPU tensor-operator runtime on wgpu.
//!
//! This crate provides the resource and dispatch engine under a tensor-op
//! executor:
//! - **Pooled buffers**: size-bucketed reuse with generation-stamped release,
//!   so a freed buffer is never recycled while a recorded batch still
//!   references it
//! - **Cached programs**: one pipeline compilation per (kernel, shape hint)
//!   key, with the expected uniform layout checked on every dispatch
//! - **Batched dispatch**: compute work accumulates into one command
//!   submission, flushed automatically at a configurable cap
//! - **Closed operator set**: kernels are pure planners; resolution is an
//!   exhaustive enum match, not a runtime name lookup
//!
//! # Quick Start
//!
//! ```ignore
//! use gpurt::{DataType, Engine, GpuContext, OpKind, TensorDesc, UsageClass};
//!
//! let mut engine = Engine::new(GpuContext::new_sync()?);
//! let input = engine.alloc(1024, UsageClass::Storage)?;
//! engine.upload_slice(input, &data)?;
//! let outputs = engine.run(OpKind::Relu, &[TensorDesc {
//!     dtype: DataType::F32,
//!     shape: vec![256],
//!     buffer: input,
//! }])?;
//! let result: Vec<f32> = engine.download_vec(outputs[0].buffer, 256)?;
//! ```

pub mod backing;
pub mod device;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod kernel;
pub mod kernels;
pub mod pool;
pub mod program;
pub mod shape;
pub mod transfer;

pub use backing::{DeviceBacking, UsageClass};
pub use device::{GpuContext, WgpuProgram};
pub use dispatch::{normalize_workgroups, CommandDispatcher};
pub use engine::{Engine, EngineConfig};
pub use error::{GpuError, GpuResult};
pub use kernel::{DataType, Kernel, KernelPlan, OpKind, OutputSpec, TensorDesc};
pub use pool::{bucket_size, BufferHandle, BufferPool, SessionId};
pub use program::{
    program_key, ProgramArtifact, ProgramCache, ProgramDescriptor, UniformSpec, UniformType,
    UniformValue, UniformValues,
};
pub use shape::{broadcast_shapes, broadcast_strides};
pub use transfer::Element;
