use thiserror::Error;

use crate::pool::BufferHandle;

/// Errors surfaced by the runtime.
///
/// Contract violations (unknown handles, uniform layout drift, oversized
/// dispatches) and device-level failures are all fatal: nothing in this crate
/// retries or silently corrects them.
#[derive(Debug, Error)]
pub enum GpuError {
    #[error("no compatible GPU adapter found")]
    NoAdapter,
    #[error("device error: {0}")]
    Device(String),
    #[error("out of device memory: requested {requested} bytes")]
    OutOfMemory { requested: u64 },
    #[error("unknown buffer handle {0}")]
    UnknownHandle(BufferHandle),
    #[error("uniform layout mismatch for `{program}`: {reason}")]
    UniformLayoutMismatch { program: String, reason: String },
    #[error("dispatch of {size} workgroups exceeds device limit {limit} per dimension")]
    DispatchTooLarge { size: u64, limit: u32 },
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("transfer failed: {0}")]
    Transfer(String),
}

pub type GpuResult<T> = Result<T, GpuError>;
