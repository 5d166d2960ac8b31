//! The engine ties the context, pool, program cache, and dispatcher together
//! and exposes the operator execution surface.
//!
//! All state lives in one `Engine` value mutated through `&mut`, so there is
//! exactly one command-recording timeline: a second kernel cannot start while
//! one is being recorded, by construction.

use crate::backing::UsageClass;
use crate::device::GpuContext;
use crate::dispatch::{normalize_workgroups, CommandDispatcher};
use crate::error::{GpuError, GpuResult};
use crate::kernel::{DataType, KernelPlan, OpKind, TensorDesc};
use crate::pool::{BufferHandle, BufferPool, SessionId};
use crate::program::{program_key, ProgramCache};
use crate::transfer::{self, Element};

/// Tunables for batching and pooling behavior.
#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    /// Recorded dispatches that force a batch submission.
    pub max_dispatches_per_batch: u32,
    /// Idle buffers retained per (bucket, class) before excess is destroyed.
    pub max_free_buffers_per_bucket: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_dispatches_per_batch: 16,
            max_free_buffers_per_bucket: 8,
        }
    }
}

/// GPU tensor-operator execution engine.
pub struct Engine {
    ctx: GpuContext,
    pool: BufferPool<GpuContext>,
    programs: ProgramCache<GpuContext>,
    dispatcher: CommandDispatcher,
}

impl Engine {
    pub fn new(ctx: GpuContext) -> Self {
        Self::with_config(ctx, EngineConfig::default())
    }

    pub fn with_config(ctx: GpuContext, config: EngineConfig) -> Self {
        Self {
            ctx,
            pool: BufferPool::new(config.max_free_buffers_per_bucket),
            programs: ProgramCache::new(),
            dispatcher: CommandDispatcher::new(config.max_dispatches_per_batch),
        }
    }

    pub fn context(&self) -> &GpuContext {
        &self.ctx
    }

    /// Allocate a device buffer of at least `size` bytes.
    pub fn alloc(&mut self, size: u64, class: UsageClass) -> GpuResult<BufferHandle> {
        self.pool.alloc(&self.ctx, size, class)
    }

    /// Release a buffer; returns its original requested size. The underlying
    /// device buffer becomes reusable once the current batch is flushed.
    pub fn free(&mut self, handle: BufferHandle) -> GpuResult<u64> {
        self.pool.free(handle, self.dispatcher.recording_generation())
    }

    /// Copy host bytes into a device buffer.
    pub fn upload(&mut self, handle: BufferHandle, bytes: &[u8]) -> GpuResult<()> {
        transfer::upload(&self.ctx, &mut self.pool, &mut self.dispatcher, handle, bytes)
    }

    /// Typed upload helper.
    pub fn upload_slice<T: Element>(&mut self, handle: BufferHandle, data: &[T]) -> GpuResult<()> {
        self.upload(handle, bytemuck::cast_slice(data))
    }

    /// Read bytes back from a device buffer. Flushes pending work first.
    pub fn download(&mut self, handle: BufferHandle, size: u64) -> GpuResult<Vec<u8>> {
        transfer::download(&self.ctx, &mut self.pool, &mut self.dispatcher, handle, size)
    }

    /// Typed download helper.
    pub fn download_vec<T: Element>(&mut self, handle: BufferHandle, count: usize) -> GpuResult<Vec<T>> {
        let bytes = self.download(handle, (count * std::mem::size_of::<T>()) as u64)?;
        // pod_collect_to_vec re-copies: the byte vector's alignment is 1.
        Ok(bytemuck::pod_collect_to_vec(&bytes))
    }

    /// Record a device-side copy between two buffers.
    pub fn copy(&mut self, src: BufferHandle, dst: BufferHandle, size: u64) -> GpuResult<()> {
        transfer::copy_device_to_device(
            &self.ctx,
            &self.pool,
            &mut self.dispatcher,
            src,
            dst,
            size,
        )
    }

    /// Submit the current batch and recycle buffers freed while it was built.
    pub fn flush(&mut self) {
        self.dispatcher.flush(&self.ctx, &mut self.pool);
    }

    /// Register a caller-owned buffer under (session, index) for zero-copy
    /// interop. Idempotent per slot. The buffer must carry usage flags
    /// matching how it will be bound (storage and/or copy).
    pub fn register_external_buffer(
        &mut self,
        session: SessionId,
        index: usize,
        buffer: wgpu::Buffer,
        size: u64,
    ) -> GpuResult<BufferHandle> {
        self.pool.register_external(session, index, buffer, size)
    }

    /// Release every external registration belonging to `session`.
    pub fn unregister_session(&mut self, session: SessionId) {
        self.pool.unregister_session(session);
    }

    /// Execute one operator: plan, resolve the cached program, allocate
    /// outputs, and record the dispatch into the current batch.
    ///
    /// Input validation happens inside the kernel's `plan` before any
    /// resource is touched, so a rejected invocation leaks nothing.
    pub fn run(&mut self, op: OpKind, inputs: &[TensorDesc]) -> GpuResult<Vec<TensorDesc>> {
        let kernel = op.kernel();
        let KernelPlan {
            shape_hint,
            one_dim,
            shader,
            workgroups,
            uniforms,
            outputs: output_specs,
        } = kernel.plan(inputs)?;

        for tensor in inputs {
            if tensor.dtype == DataType::F16 && !self.ctx.supports_f16() {
                return Err(GpuError::InvalidInput(
                    "device does not support f16 shaders".into(),
                ));
            }
            if self.pool.requested_size(tensor.buffer)? < tensor.byte_size() {
                return Err(GpuError::InvalidInput(format!(
                    "input buffer {} is smaller than its tensor ({} bytes)",
                    tensor.buffer,
                    tensor.byte_size()
                )));
            }
        }

        let workgroups = normalize_workgroups(workgroups, self.ctx.max_workgroups_per_dim())?;
        let key = program_key(kernel.name(), &shape_hint, one_dim);
        let program = self.programs.get_or_build(&self.ctx, &key, shader)?;
        program.check_uniforms(&uniforms)?;

        let mut outputs = Vec::with_capacity(output_specs.len());
        for spec in &output_specs {
            let buffer = match spec.alias_of {
                Some(i) => {
                    inputs
                        .get(i)
                        .ok_or_else(|| {
                            GpuError::InvalidInput(format!(
                                "output aliases input {i}, but only {} inputs were given",
                                inputs.len()
                            ))
                        })?
                        .buffer
                }
                None => {
                    let bytes: usize = spec.shape.iter().product::<usize>() * spec.dtype.size();
                    self.pool.alloc(&self.ctx, bytes as u64, UsageClass::Storage)?
                }
            };
            outputs.push(TensorDesc {
                dtype: spec.dtype,
                shape: spec.shape.clone(),
                buffer,
            });
        }

        let input_handles: Vec<BufferHandle> = inputs.iter().map(|t| t.buffer).collect();
        let output_handles: Vec<BufferHandle> = outputs.iter().map(|t| t.buffer).collect();
        self.dispatcher.dispatch(
            &self.ctx,
            &mut self.pool,
            &program,
            &input_handles,
            &output_handles,
            workgroups,
            &uniforms,
        )?;

        Ok(outputs)
    }

    /// Dispatches recorded into the batch since the last flush.
    pub fn pending_dispatches(&self) -> u32 {
        self.dispatcher.pending_dispatches()
    }

    /// Idle buffers currently held by the pool's free lists.
    pub fn idle_buffers(&self) -> usize {
        self.pool.idle_count()
    }

    /// Compiled programs held by the cache.
    pub fn cached_programs(&self) -> usize {
        self.programs.len()
    }
}
