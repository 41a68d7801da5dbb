use std::sync::Arc;

use crate::memory::PoolShared;

/// A block of device memory carved out of a [`MemoryPool`](crate::MemoryPool).
///
/// Dropping the buffer returns its block to the pool's free lists rather
/// than releasing it; the bytes stay reserved until the pool cache is emptied.
pub struct DeviceBuffer {
    block: Vec<u8>,
    len: usize,
    pool: Arc<PoolShared>,
}

impl DeviceBuffer {
    pub(crate) fn new(block: Vec<u8>, len: usize, pool: Arc<PoolShared>) -> Self {
        Self { block, len, pool }
    }

    /// Requested length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes actually reserved for this buffer (aligned, possibly a larger
    /// reused block).
    pub fn reserved_bytes(&self) -> usize {
        self.block.len()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.block[..self.len]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.block[..self.len]
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        self.pool.release(std::mem::take(&mut self.block));
    }
}

impl std::fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("len", &self.len)
            .field("reserved_bytes", &self.block.len())
            .finish()
    }
}
