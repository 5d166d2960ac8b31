//! Size-bucketed GPU buffer pool with deferred, generation-stamped release.
//!
//! Allocations are rounded up to a bucket ladder (powers of two from 64 B to
//! 128 MiB; larger requests round to 16-byte alignment and are not pooled by
//! ladder position). Freeing a buffer parks it with the command batch
//! generation that was being recorded at the time; the buffer only re-enters
//! the free lists once that generation has been submitted to the device, so a
//! recycled buffer can never race a command that still references it.

use std::collections::HashMap;
use std::fmt;

use crate::backing::{DeviceBacking, UsageClass};
use crate::error::{GpuError, GpuResult};

/// Opaque identifier naming one logical GPU allocation between `alloc` and
/// `free`. Handles are never reused within the lifetime of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferHandle(u64);

impl fmt::Display for BufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identifier for a caller-owned session holding external buffer
/// registrations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub u64);

const BUCKET_MIN: u64 = 64;
const BUCKET_MAX: u64 = 128 * 1024 * 1024;
const LARGE_ALIGN: u64 = 16;

/// Resolve a requested size to its allocation size.
///
/// Sizes up to 128 MiB round to the next power of two (minimum 64 bytes);
/// anything larger rounds up to 16-byte alignment instead.
pub fn bucket_size(size: u64) -> u64 {
    let size = size.max(1);
    if size <= BUCKET_MAX {
        size.next_power_of_two().max(BUCKET_MIN)
    } else {
        (size + LARGE_ALIGN - 1) & !(LARGE_ALIGN - 1)
    }
}

struct BufferRecord<B> {
    raw: B,
    requested: u64,
    bucket: u64,
    class: UsageClass,
    external: Option<(SessionId, usize)>,
}

struct PendingFree<B> {
    raw: B,
    bucket: u64,
    class: UsageClass,
    generation: u64,
}

/// The pool itself. Single logical owner; access is serialized by the engine.
pub struct BufferPool<D: DeviceBacking> {
    records: HashMap<BufferHandle, BufferRecord<D::Buffer>>,
    free: HashMap<(u64, UsageClass), Vec<D::Buffer>>,
    pending: Vec<PendingFree<D::Buffer>>,
    external: HashMap<(SessionId, usize), BufferHandle>,
    next_id: u64,
    max_free_per_bucket: usize,
}

impl<D: DeviceBacking> BufferPool<D> {
    pub fn new(max_free_per_bucket: usize) -> Self {
        Self {
            records: HashMap::new(),
            free: HashMap::new(),
            pending: Vec::new(),
            external: HashMap::new(),
            next_id: 0,
            max_free_per_bucket,
        }
    }

    fn next_handle(&mut self) -> BufferHandle {
        let handle = BufferHandle(self.next_id);
        self.next_id += 1;
        handle
    }

    /// Allocate a buffer of at least `size` bytes.
    ///
    /// A free buffer of the resolved bucket and matching class is reused
    /// without touching the device; otherwise a new device buffer is created
    /// at the bucket size. Device allocation failure propagates unretried.
    pub fn alloc(&mut self, backing: &D, size: u64, class: UsageClass) -> GpuResult<BufferHandle> {
        let bucket = bucket_size(size);
        let raw = match self.free.get_mut(&(bucket, class)).and_then(|list| list.pop()) {
            Some(raw) => {
                log::trace!("pool: reused {bucket} byte {class:?} buffer");
                raw
            }
            None => {
                log::trace!("pool: created {bucket} byte {class:?} buffer");
                backing.create_buffer(bucket, class)?
            }
        };
        let handle = self.next_handle();
        self.records.insert(
            handle,
            BufferRecord {
                raw,
                requested: size,
                bucket,
                class,
                external: None,
            },
        );
        Ok(handle)
    }

    /// Release a buffer, returning its original requested size.
    ///
    /// The device buffer is parked under `generation` (the batch currently
    /// being recorded) and becomes reusable only after [`retire`] passes that
    /// generation. Externally registered buffers cannot be freed here; they
    /// are released by [`unregister_session`].
    ///
    /// [`retire`]: BufferPool::retire
    /// [`unregister_session`]: BufferPool::unregister_session
    pub fn free(&mut self, handle: BufferHandle, generation: u64) -> GpuResult<u64> {
        let existing = self.records.get(&handle).ok_or(GpuError::UnknownHandle(handle))?;
        if existing.external.is_some() {
            return Err(GpuError::InvalidInput(format!(
                "buffer {handle} is externally owned; release it by unregistering its session"
            )));
        }
        let record = self.records.remove(&handle).ok_or(GpuError::UnknownHandle(handle))?;
        self.pending.push(PendingFree {
            raw: record.raw,
            bucket: record.bucket,
            class: record.class,
            generation,
        });
        Ok(record.requested)
    }

    /// Move parked buffers whose generation has been submitted into the free
    /// lists. Buckets already holding their maximum free count destroy the
    /// buffer instead, capping retention for rarely-reused sizes.
    pub fn retire(&mut self, backing: &D, completed_generation: u64) {
        let mut still_pending = Vec::with_capacity(self.pending.len());
        for parked in self.pending.drain(..) {
            if parked.generation > completed_generation {
                still_pending.push(parked);
                continue;
            }
            let list = self.free.entry((parked.bucket, parked.class)).or_default();
            if list.len() < self.max_free_per_bucket {
                list.push(parked.raw);
            } else {
                log::trace!(
                    "pool: bucket {} {:?} full, destroying buffer",
                    parked.bucket,
                    parked.class
                );
                backing.destroy_buffer(parked.raw);
            }
        }
        self.pending = still_pending;
    }

    /// Look up the device buffer behind a live handle.
    pub fn get(&self, handle: BufferHandle) -> GpuResult<&D::Buffer> {
        self.records
            .get(&handle)
            .map(|record| &record.raw)
            .ok_or(GpuError::UnknownHandle(handle))
    }

    /// Original requested size of a live handle.
    pub fn requested_size(&self, handle: BufferHandle) -> GpuResult<u64> {
        self.records
            .get(&handle)
            .map(|record| record.requested)
            .ok_or(GpuError::UnknownHandle(handle))
    }

    /// Register a caller-owned buffer under (session, index).
    ///
    /// Registering the same slot twice returns the original handle. External
    /// buffers are never destroyed nor recycled into the free lists.
    pub fn register_external(
        &mut self,
        session: SessionId,
        index: usize,
        raw: D::Buffer,
        size: u64,
    ) -> GpuResult<BufferHandle> {
        if size == 0 || size % 4 != 0 {
            return Err(GpuError::InvalidInput(format!(
                "external buffer size must be a positive multiple of 4, got {size}"
            )));
        }
        if let Some(&handle) = self.external.get(&(session, index)) {
            return Ok(handle);
        }
        let handle = self.next_handle();
        self.records.insert(
            handle,
            BufferRecord {
                raw,
                requested: size,
                bucket: size,
                class: UsageClass::Storage,
                external: Some((session, index)),
            },
        );
        self.external.insert((session, index), handle);
        Ok(handle)
    }

    /// Drop every external registration belonging to `session`. The caller
    /// keeps ownership of the underlying device buffers.
    pub fn unregister_session(&mut self, session: SessionId) {
        let handles: Vec<BufferHandle> = self
            .external
            .iter()
            .filter(|((s, _), _)| *s == session)
            .map(|(_, &h)| h)
            .collect();
        for handle in handles {
            if let Some(record) = self.records.remove(&handle) {
                if let Some(slot) = record.external {
                    self.external.remove(&slot);
                }
            }
        }
    }

    /// Number of idle buffers currently held in the free lists.
    pub fn idle_count(&self) -> usize {
        self.free.values().map(Vec::len).sum()
    }

    /// Number of buffers parked awaiting generation retirement.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::ProgramDescriptor;
    use std::cell::Cell;

    /// Counting mock: buffers are integer ids, pipelines are units.
    struct MockBacking {
        created: Cell<u32>,
        destroyed: Cell<u32>,
        fail_next: Cell<bool>,
    }

    impl MockBacking {
        fn new() -> Self {
            Self {
                created: Cell::new(0),
                destroyed: Cell::new(0),
                fail_next: Cell::new(false),
            }
        }
    }

    impl DeviceBacking for MockBacking {
        type Buffer = u32;
        type Pipeline = ();

        fn create_buffer(&self, size: u64, _class: UsageClass) -> GpuResult<u32> {
            if self.fail_next.replace(false) {
                return Err(GpuError::OutOfMemory { requested: size });
            }
            let id = self.created.get();
            self.created.set(id + 1);
            Ok(id)
        }

        fn destroy_buffer(&self, _buffer: u32) {
            self.destroyed.set(self.destroyed.get() + 1);
        }

        fn compile(&self, _desc: &ProgramDescriptor) -> GpuResult<()> {
            Ok(())
        }
    }

    #[test]
    fn test_bucket_monotonicity() {
        for size in [1u64, 63, 64, 65, 100, 1000, 4096, 5000, 1 << 20, BUCKET_MAX] {
            assert!(bucket_size(size) >= size, "bucket for {size} too small");
        }
        assert_eq!(bucket_size(1), 64);
        assert_eq!(bucket_size(64), 64);
        assert_eq!(bucket_size(65), 128);
        assert_eq!(bucket_size(100), 128);
    }

    #[test]
    fn test_bucket_large_sizes_align_to_16() {
        let huge = BUCKET_MAX + 3;
        let bucket = bucket_size(huge);
        assert!(bucket >= huge);
        assert_eq!(bucket % 16, 0);
        // No power-of-two blowup past the ladder.
        assert!(bucket < huge + 16);
    }

    #[test]
    fn test_reuse_after_retire_is_same_buffer() {
        let backing = MockBacking::new();
        let mut pool = BufferPool::<MockBacking>::new(8);

        let h1 = pool.alloc(&backing, 100, UsageClass::Storage).unwrap();
        let raw1 = *pool.get(h1).unwrap();
        assert_eq!(pool.free(h1, 1).unwrap(), 100);
        pool.retire(&backing, 1);

        let h2 = pool.alloc(&backing, 100, UsageClass::Storage).unwrap();
        let raw2 = *pool.get(h2).unwrap();

        assert_ne!(h1, h2, "handles are never reused");
        assert_eq!(raw1, raw2, "device buffer must be recycled");
        assert_eq!(backing.created.get(), 1, "exactly one real allocation");
    }

    #[test]
    fn test_no_premature_reuse_before_retire() {
        let backing = MockBacking::new();
        let mut pool = BufferPool::<MockBacking>::new(8);

        let h1 = pool.alloc(&backing, 256, UsageClass::Storage).unwrap();
        pool.free(h1, 5).unwrap();

        // Generation 5 not yet submitted: the buffer must stay parked.
        let h2 = pool.alloc(&backing, 256, UsageClass::Storage).unwrap();
        assert_eq!(backing.created.get(), 2);
        assert_eq!(pool.pending_count(), 1);

        // Retiring an older generation does not release it either.
        pool.retire(&backing, 4);
        assert_eq!(pool.pending_count(), 1);

        pool.retire(&backing, 5);
        assert_eq!(pool.pending_count(), 0);
        assert_eq!(pool.idle_count(), 1);
        pool.free(h2, 6).unwrap();
    }

    #[test]
    fn test_usage_classes_do_not_mix() {
        let backing = MockBacking::new();
        let mut pool = BufferPool::<MockBacking>::new(8);

        let h1 = pool.alloc(&backing, 64, UsageClass::Storage).unwrap();
        pool.free(h1, 1).unwrap();
        pool.retire(&backing, 1);

        // Same bucket, different class: must not reuse the storage buffer.
        pool.alloc(&backing, 64, UsageClass::Uniform).unwrap();
        assert_eq!(backing.created.get(), 2);
    }

    #[test]
    fn test_bucket_cap_destroys_excess() {
        let backing = MockBacking::new();
        let mut pool = BufferPool::<MockBacking>::new(1);

        let h1 = pool.alloc(&backing, 64, UsageClass::Storage).unwrap();
        let h2 = pool.alloc(&backing, 64, UsageClass::Storage).unwrap();
        pool.free(h1, 1).unwrap();
        pool.free(h2, 1).unwrap();
        pool.retire(&backing, 1);

        assert_eq!(pool.idle_count(), 1, "bucket capped at one idle buffer");
        assert_eq!(backing.destroyed.get(), 1, "excess buffer destroyed");
    }

    #[test]
    fn test_alloc_failure_propagates() {
        let backing = MockBacking::new();
        let mut pool = BufferPool::<MockBacking>::new(8);
        backing.fail_next.set(true);
        let err = pool.alloc(&backing, 1024, UsageClass::Storage).unwrap_err();
        assert!(matches!(err, GpuError::OutOfMemory { .. }));
    }

    #[test]
    fn test_unknown_handle_errors() {
        let backing = MockBacking::new();
        let mut pool = BufferPool::<MockBacking>::new(8);
        let h = pool.alloc(&backing, 64, UsageClass::Storage).unwrap();
        pool.free(h, 1).unwrap();
        assert!(matches!(pool.get(h), Err(GpuError::UnknownHandle(_))));
        assert!(matches!(pool.free(h, 1), Err(GpuError::UnknownHandle(_))));
    }

    #[test]
    fn test_external_registration_is_idempotent() {
        let backing = MockBacking::new();
        let mut pool = BufferPool::<MockBacking>::new(8);
        let session = SessionId(7);

        let h1 = pool.register_external(session, 0, 1000, 256).unwrap();
        let h2 = pool.register_external(session, 0, 1001, 256).unwrap();
        assert_eq!(h1, h2, "same slot returns the same handle");

        // Externally owned buffers cannot go through free().
        assert!(matches!(pool.free(h1, 1), Err(GpuError::InvalidInput(_))));

        pool.unregister_session(session);
        assert!(matches!(pool.get(h1), Err(GpuError::UnknownHandle(_))));
        assert_eq!(backing.destroyed.get(), 0, "pool never destroys external buffers");
    }

    #[test]
    fn test_external_size_must_be_word_aligned() {
        let mut pool = BufferPool::<MockBacking>::new(8);
        let err = pool.register_external(SessionId(1), 0, 42, 10).unwrap_err();
        assert!(matches!(err, GpuError::InvalidInput(_)));
    }
}
