//! Host↔device transfers.
//!
//! Uploads go through a pooled, host-mappable staging buffer whose release is
//! deferred to the batch that recorded the copy. Downloads use a fresh
//! read-back buffer each time; read-back sizes rarely repeat, so pooling them
//! would only pin memory.

use std::sync::mpsc;

use crate::backing::UsageClass;
use crate::device::GpuContext;
use crate::dispatch::CommandDispatcher;
use crate::error::{GpuError, GpuResult};
use crate::kernel::DataType;
use crate::pool::{BufferHandle, BufferPool};

/// Host-representable tensor element.
pub trait Element: bytemuck::Pod {
    const DTYPE: DataType;
}

impl Element for f32 {
    const DTYPE: DataType = DataType::F32;
}

impl Element for half::f16 {
    const DTYPE: DataType = DataType::F16;
}

impl Element for u32 {
    const DTYPE: DataType = DataType::U32;
}

impl Element for i32 {
    const DTYPE: DataType = DataType::I32;
}

pub(crate) fn align_copy_size(size: u64) -> u64 {
    let align = wgpu::COPY_BUFFER_ALIGNMENT;
    (size + align - 1) & !(align - 1)
}

fn map_write(ctx: &GpuContext, buffer: &wgpu::Buffer, bytes: &[u8]) -> GpuResult<()> {
    let slice = buffer.slice(..);
    let (tx, rx) = mpsc::channel();
    slice.map_async(wgpu::MapMode::Write, move |result| {
        let _ = tx.send(result);
    });
    let _ = ctx.device().poll(wgpu::PollType::Wait);
    rx.recv()
        .map_err(|_| GpuError::Transfer("map_async channel closed".into()))?
        .map_err(|e| GpuError::Transfer(format!("staging map failed: {e}")))?;

    let mut view = slice.get_mapped_range_mut();
    view[..bytes.len()].copy_from_slice(bytes);
    drop(view);
    buffer.unmap();
    Ok(())
}

/// Copy host bytes into a device buffer via a pooled staging buffer.
///
/// The staging buffer is freed back to the pool as soon as the device copy is
/// recorded; deferred release keeps it out of circulation until the batch
/// that uses it has been submitted.
pub(crate) fn upload(
    ctx: &GpuContext,
    pool: &mut BufferPool<GpuContext>,
    dispatcher: &mut CommandDispatcher,
    dst: BufferHandle,
    bytes: &[u8],
) -> GpuResult<()> {
    if bytes.is_empty() {
        return Ok(());
    }
    let len = bytes.len() as u64;
    if pool.requested_size(dst)? < len {
        return Err(GpuError::InvalidInput(format!(
            "upload of {len} bytes exceeds buffer {dst} capacity"
        )));
    }

    let staging = pool.alloc(ctx, len, UsageClass::Upload)?;
    map_write(ctx, pool.get(staging)?, bytes)?;
    dispatcher.record_copy(ctx, pool.get(staging)?, pool.get(dst)?, align_copy_size(len));
    pool.free(staging, dispatcher.recording_generation())?;
    Ok(())
}

/// Read `size` bytes back from a device buffer.
///
/// Flushes the current batch so every recorded write to the buffer is visible
/// before the copy is observed.
pub(crate) fn download(
    ctx: &GpuContext,
    pool: &mut BufferPool<GpuContext>,
    dispatcher: &mut CommandDispatcher,
    src: BufferHandle,
    size: u64,
) -> GpuResult<Vec<u8>> {
    if size == 0 {
        return Ok(Vec::new());
    }
    if pool.requested_size(src)? < size {
        return Err(GpuError::InvalidInput(format!(
            "download of {size} bytes exceeds buffer {src} capacity"
        )));
    }

    let aligned = align_copy_size(size);
    let readback = ctx.device().create_buffer(&wgpu::BufferDescriptor {
        label: Some("gpurt readback"),
        size: aligned,
        usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    });

    dispatcher.record_copy(ctx, pool.get(src)?, &readback, aligned);
    dispatcher.flush(ctx, pool);

    let slice = readback.slice(..);
    let (tx, rx) = mpsc::channel();
    slice.map_async(wgpu::MapMode::Read, move |result| {
        let _ = tx.send(result);
    });
    let _ = ctx.device().poll(wgpu::PollType::Wait);
    rx.recv()
        .map_err(|_| GpuError::Transfer("map_async channel closed".into()))?
        .map_err(|e| GpuError::Transfer(format!("readback map failed: {e}")))?;

    let data = slice.get_mapped_range();
    let bytes = data[..size as usize].to_vec();
    drop(data);
    readback.unmap();
    readback.destroy();
    Ok(bytes)
}

/// Record a device-side copy between two pooled buffers.
pub(crate) fn copy_device_to_device(
    ctx: &GpuContext,
    pool: &BufferPool<GpuContext>,
    dispatcher: &mut CommandDispatcher,
    src: BufferHandle,
    dst: BufferHandle,
    size: u64,
) -> GpuResult<()> {
    if size == 0 {
        return Ok(());
    }
    if pool.requested_size(src)? < size || pool.requested_size(dst)? < size {
        return Err(GpuError::InvalidInput(format!(
            "device copy of {size} bytes exceeds buffer capacity ({src} -> {dst})"
        )));
    }
    dispatcher.record_copy(ctx, pool.get(src)?, pool.get(dst)?, align_copy_size(size));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_copy_size() {
        assert_eq!(align_copy_size(1), 4);
        assert_eq!(align_copy_size(4), 4);
        assert_eq!(align_copy_size(6), 8);
        assert_eq!(align_copy_size(256), 256);
    }

    #[test]
    fn test_element_dtypes() {
        assert_eq!(f32::DTYPE, DataType::F32);
        assert_eq!(half::f16::DTYPE, DataType::F16);
        assert_eq!(u32::DTYPE, DataType::U32);
        assert_eq!(i32::DTYPE, DataType::I32);
        assert_eq!(DataType::F16.size(), 2);
    }
}
