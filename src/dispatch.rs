//! Command dispatcher: batches kernel dispatches into one device submission,
//! bounds batch growth with a pending-dispatch cap, and normalizes workgroup
//! counts against device limits.

use crate::backing::UsageClass;
use crate::device::{GpuContext, WgpuProgram};
use crate::error::{GpuError, GpuResult};
use crate::pool::{BufferHandle, BufferPool};
use crate::program::{ProgramArtifact, UniformValues};

/// Pending-dispatch and generation bookkeeping, device-independent.
#[derive(Debug)]
pub(crate) struct DispatchBudget {
    pending: u32,
    max_pending: u32,
    recording: u64,
    completed: u64,
}

impl DispatchBudget {
    pub(crate) fn new(max_pending: u32) -> Self {
        Self {
            pending: 0,
            max_pending: max_pending.max(1),
            recording: 1,
            completed: 0,
        }
    }

    /// Count one recorded dispatch; true when the batch has hit its cap and
    /// must be flushed.
    pub(crate) fn record(&mut self) -> bool {
        self.pending += 1;
        self.pending >= self.max_pending
    }

    /// Close the current generation; returns the generation just completed.
    pub(crate) fn flush(&mut self) -> u64 {
        self.pending = 0;
        self.completed = self.recording;
        self.recording += 1;
        self.completed
    }

    pub(crate) fn pending(&self) -> u32 {
        self.pending
    }

    pub(crate) fn recording(&self) -> u64 {
        self.recording
    }
}

/// Re-factor a workgroup count so every dimension stays within the device's
/// per-dimension limit.
///
/// Counts already within bounds pass through. Otherwise the flat product is
/// redistributed: one dimension if it fits, then a square split, then a
/// near-cube-root split. A flat count above `limit^3` cannot be dispatched.
pub fn normalize_workgroups(counts: [u32; 3], limit: u32) -> GpuResult<[u32; 3]> {
    if counts.iter().all(|&c| c <= limit) {
        return Ok(counts);
    }
    let limit64 = limit as u64;
    let flat: u64 = counts.iter().map(|&c| c as u64).product();
    if flat <= limit64 {
        return Ok([flat as u32, 1, 1]);
    }

    let mut side = (flat as f64).sqrt() as u64;
    while side * side < flat {
        side += 1;
    }
    if side <= limit64 {
        let rows = flat.div_ceil(side);
        return Ok([side as u32, rows as u32, 1]);
    }

    let mut edge = (flat as f64).cbrt() as u64;
    while edge * edge * edge < flat {
        edge += 1;
    }
    if edge <= limit64 {
        let depth = flat.div_ceil(edge * edge);
        if depth <= limit64 {
            return Ok([edge as u32, edge as u32, depth as u32]);
        }
    }

    Err(GpuError::DispatchTooLarge { size: flat, limit })
}

/// Records compute work into a shared encoder and submits it in batches.
///
/// A batch is implicitly open whenever anything has been recorded since the
/// last flush. Hitting the configured dispatch cap flushes automatically,
/// bounding both latency-to-first-result and peak buffer retention.
pub struct CommandDispatcher {
    encoder: Option<wgpu::CommandEncoder>,
    budget: DispatchBudget,
}

impl CommandDispatcher {
    pub fn new(max_dispatches: u32) -> Self {
        Self {
            encoder: None,
            budget: DispatchBudget::new(max_dispatches),
        }
    }

    /// Generation currently being recorded. Frees issued now must not be
    /// recycled until this generation has been flushed.
    pub fn recording_generation(&self) -> u64 {
        self.budget.recording()
    }

    pub fn pending_dispatches(&self) -> u32 {
        self.budget.pending()
    }

    fn encoder(&mut self, ctx: &GpuContext) -> &mut wgpu::CommandEncoder {
        self.encoder.get_or_insert_with(|| {
            ctx.device()
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("gpurt batch"),
                })
        })
    }

    /// Record a buffer-to-buffer copy into the current batch.
    pub(crate) fn record_copy(
        &mut self,
        ctx: &GpuContext,
        src: &wgpu::Buffer,
        dst: &wgpu::Buffer,
        size: u64,
    ) {
        self.encoder(ctx).copy_buffer_to_buffer(src, 0, dst, 0, size);
    }

    /// Record one compute dispatch.
    ///
    /// Uniform values are checked against the program's expected layout
    /// before anything touches the device. The transient uniform block is
    /// drawn from the pool and freed back under the current generation, so it
    /// cannot be recycled while this batch still references it.
    pub fn dispatch(
        &mut self,
        ctx: &GpuContext,
        pool: &mut BufferPool<GpuContext>,
        program: &ProgramArtifact<WgpuProgram>,
        inputs: &[BufferHandle],
        outputs: &[BufferHandle],
        workgroups: [u32; 3],
        uniforms: &UniformValues,
    ) -> GpuResult<()> {
        program.check_uniforms(uniforms)?;
        if inputs.len() != program.inputs || outputs.len() != program.outputs {
            return Err(GpuError::InvalidInput(format!(
                "program `{}` binds {} inputs / {} outputs, got {} / {}",
                program.key,
                program.inputs,
                program.outputs,
                inputs.len(),
                outputs.len()
            )));
        }
        let workgroups = normalize_workgroups(workgroups, ctx.max_workgroups_per_dim())?;

        let uniform_handle = if uniforms.is_empty() {
            None
        } else {
            let bytes = uniforms.to_bytes();
            let handle = pool.alloc(ctx, bytes.len() as u64, UsageClass::Uniform)?;
            ctx.queue().write_buffer(pool.get(handle)?, 0, &bytes);
            Some(handle)
        };

        let mut entries = Vec::with_capacity(inputs.len() + outputs.len() + 1);
        for (i, handle) in inputs.iter().chain(outputs.iter()).enumerate() {
            entries.push(wgpu::BindGroupEntry {
                binding: i as u32,
                resource: pool.get(*handle)?.as_entire_binding(),
            });
        }
        if let Some(handle) = uniform_handle {
            entries.push(wgpu::BindGroupEntry {
                binding: (inputs.len() + outputs.len()) as u32,
                resource: pool.get(handle)?.as_entire_binding(),
            });
        }

        let bind_group = ctx.device().create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(program.key.as_str()),
            layout: &program.pipeline.bind_group_layout,
            entries: &entries,
        });
        drop(entries);

        {
            let encoder = self.encoder(ctx);
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(program.key.as_str()),
                timestamp_writes: None,
            });
            pass.set_pipeline(&program.pipeline.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(workgroups[0], workgroups[1], workgroups[2]);
        }

        if let Some(handle) = uniform_handle {
            pool.free(handle, self.budget.recording())?;
        }

        if self.budget.record() {
            log::debug!(
                "dispatch cap {} reached, flushing batch",
                self.budget.pending()
            );
            self.flush(ctx, pool);
        }
        Ok(())
    }

    /// Submit the recorded batch and make the buffers freed during its
    /// construction available for reuse.
    pub fn flush(&mut self, ctx: &GpuContext, pool: &mut BufferPool<GpuContext>) {
        if let Some(encoder) = self.encoder.take() {
            ctx.queue().submit(Some(encoder.finish()));
        }
        let completed = self.budget.flush();
        pool.retire(ctx, completed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_within_limits_passes_through() {
        assert_eq!(normalize_workgroups([10, 2, 3], 100).unwrap(), [10, 2, 3]);
        assert_eq!(normalize_workgroups([100, 1, 1], 100).unwrap(), [100, 1, 1]);
    }

    #[test]
    fn test_normalize_square_split() {
        let limit = 100;
        let [x, y, z] = normalize_workgroups([5000, 1, 1], limit).unwrap();
        assert!(x <= limit && y <= limit && z <= limit);
        assert!(x as u64 * y as u64 * z as u64 >= 5000);
    }

    #[test]
    fn test_normalize_cube_split() {
        let limit = 100;
        let flat = 800_000u32; // above limit^2, below limit^3
        let [x, y, z] = normalize_workgroups([flat, 1, 1], limit).unwrap();
        assert!(x <= limit && y <= limit && z <= limit);
        assert!(x as u64 * y as u64 * z as u64 >= flat as u64);
    }

    #[test]
    fn test_normalize_rejects_above_cube_of_limit() {
        let limit = 10;
        let err = normalize_workgroups([1001, 1, 1], limit).unwrap_err();
        assert!(matches!(err, GpuError::DispatchTooLarge { .. }));
        // Exactly limit^3 still fits.
        let [x, y, z] = normalize_workgroups([1000, 1, 1], limit).unwrap();
        assert_eq!((x, y, z), (10, 10, 10));
    }

    #[test]
    fn test_normalize_multi_dim_overflow_refactors_flat_product() {
        let limit = 50;
        let [x, y, z] = normalize_workgroups([60, 4, 1], limit).unwrap();
        assert!(x <= limit && y <= limit && z <= limit);
        assert!(x as u64 * y as u64 * z as u64 >= 240);
    }

    #[test]
    fn test_budget_flushes_at_cap() {
        let mut budget = DispatchBudget::new(16);
        for _ in 0..15 {
            assert!(!budget.record());
        }
        assert!(budget.record(), "16th dispatch trips the cap");
        assert_eq!(budget.flush(), 1);
        assert_eq!(budget.pending(), 0);
        assert_eq!(budget.recording(), 2);
    }

    #[test]
    fn test_budget_generations_advance_monotonically() {
        let mut budget = DispatchBudget::new(4);
        assert_eq!(budget.recording(), 1);
        assert_eq!(budget.flush(), 1);
        assert_eq!(budget.flush(), 2);
        assert_eq!(budget.recording(), 3);
    }
}
