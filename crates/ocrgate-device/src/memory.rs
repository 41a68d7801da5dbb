use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use ocrgate_core::{OcrError, Result};

use crate::buffer::DeviceBuffer;

static POOL_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Alignment for device allocations (256 bytes, matching CUDA allocator granularity).
const DEVICE_ALLOC_ALIGN: u64 = 256;

fn align_up(size: u64, align: u64) -> u64 {
    (size + align - 1) & !(align - 1)
}

/// Capacity-bounded caching allocator standing in for accelerator memory.
///
/// Freed blocks are kept in size-bucketed free lists and stay *reserved*
/// until [`MemoryPool::empty_cache`] hands them back, the way framework
/// caching allocators behave on a GPU. An allocation that does not fit in
/// the remaining capacity fails with [`OcrError::DeviceOutOfMemory`]; the
/// pool never evicts its own cache implicitly.
#[derive(Clone)]
pub struct MemoryPool {
    shared: Arc<PoolShared>,
}

pub(crate) struct PoolShared {
    id: u64,
    capacity: u64,
    allocated: AtomicU64,
    reserved: AtomicU64,
    peak_reserved: AtomicU64,
    alloc_failures: AtomicU64,
    state: Mutex<PoolState>,
}

#[derive(Default)]
struct PoolState {
    free_lists: BTreeMap<u64, Vec<Vec<u8>>>,
    cached: u64,
}

/// Point-in-time view of pool accounting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub capacity: u64,
    pub allocated: u64,
    pub reserved: u64,
    pub cached: u64,
    pub peak_reserved: u64,
    pub alloc_failures: u64,
}

impl MemoryPool {
    pub fn new(capacity: u64) -> Self {
        let id = POOL_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self {
            shared: Arc::new(PoolShared {
                id,
                capacity,
                allocated: AtomicU64::new(0),
                reserved: AtomicU64::new(0),
                peak_reserved: AtomicU64::new(0),
                alloc_failures: AtomicU64::new(0),
                state: Mutex::new(PoolState::default()),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn capacity(&self) -> u64 {
        self.shared.capacity
    }

    /// Bytes held by live buffers.
    pub fn allocated(&self) -> u64 {
        self.shared.allocated.load(Ordering::Acquire)
    }

    /// Bytes held by live buffers plus cached free blocks.
    pub fn reserved(&self) -> u64 {
        self.shared.reserved.load(Ordering::Acquire)
    }

    /// Allocate a zero-initialised buffer of `len` bytes.
    pub fn alloc(&self, len: usize) -> Result<DeviceBuffer> {
        let size = align_up((len as u64).max(1), DEVICE_ALLOC_ALIGN);
        let mut state = self.shared.state.lock();

        // Smallest cached block that fits.
        let reuse = state
            .free_lists
            .range_mut(size..)
            .next()
            .and_then(|(&bucket, blocks)| blocks.pop().map(|block| (bucket, block)));

        if let Some((bucket, mut block)) = reuse {
            if state.free_lists.get(&bucket).is_some_and(Vec::is_empty) {
                state.free_lists.remove(&bucket);
            }
            state.cached -= bucket;
            self.shared.allocated.fetch_add(bucket, Ordering::AcqRel);
            block.fill(0);
            return Ok(DeviceBuffer::new(block, len, self.shared.clone()));
        }

        let reserved = self.shared.reserved.load(Ordering::Acquire);
        let available = self.shared.capacity.saturating_sub(reserved);
        if size > available {
            self.shared.alloc_failures.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                pool_id = self.shared.id,
                requested = size,
                available,
                cached = state.cached,
                "device allocation failed"
            );
            return Err(OcrError::DeviceOutOfMemory {
                requested: size as usize,
                available: available as usize,
            });
        }

        let reserved = self.shared.reserved.fetch_add(size, Ordering::AcqRel) + size;
        self.shared.allocated.fetch_add(size, Ordering::AcqRel);
        self.shared.peak_reserved.fetch_max(reserved, Ordering::AcqRel);
        drop(state);

        Ok(DeviceBuffer::new(vec![0u8; size as usize], len, self.shared.clone()))
    }

    /// Release every cached free block. Returns the number of bytes released.
    pub fn empty_cache(&self) -> u64 {
        let mut state = self.shared.state.lock();
        let released = state.cached;
        state.free_lists.clear();
        state.cached = 0;
        self.shared.reserved.fetch_sub(released, Ordering::AcqRel);
        released
    }

    pub fn stats(&self) -> PoolStats {
        let cached = self.shared.state.lock().cached;
        PoolStats {
            capacity: self.shared.capacity,
            allocated: self.allocated(),
            reserved: self.reserved(),
            cached,
            peak_reserved: self.shared.peak_reserved.load(Ordering::Acquire),
            alloc_failures: self.shared.alloc_failures.load(Ordering::Relaxed),
        }
    }
}

impl PoolShared {
    /// Return a block to the free lists. Called from `DeviceBuffer::drop`.
    pub(crate) fn release(&self, block: Vec<u8>) {
        let size = block.len() as u64;
        let mut state = self.state.lock();
        state.free_lists.entry(size).or_default().push(block);
        state.cached += size;
        self.allocated.fetch_sub(size, Ordering::AcqRel);
    }
}
