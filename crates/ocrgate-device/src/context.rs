use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use ocrgate_core::Result;

use crate::buffer::DeviceBuffer;
use crate::memory::{MemoryPool, PoolStats};

/// Default device memory budget: 8 GiB.
const DEFAULT_CAPACITY: u64 = 8 * 1024 * 1024 * 1024;

/// Configuration for the shared accelerator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Name used in logs and health reports.
    pub label: String,
    /// Memory budget in bytes.
    pub capacity_bytes: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            label: "accelerator0".to_string(),
            capacity_bytes: DEFAULT_CAPACITY,
        }
    }
}

/// The single shared accelerator: memory pool plus maintenance counters.
///
/// Created once at startup. Backends allocate weights from it while loading
/// and scratch space while processing; only the accelerator guard runs the
/// maintenance passes (`synchronize`, `empty_cache`, `reclaim`).
pub struct DeviceContext {
    label: String,
    pool: MemoryPool,
    syncs: AtomicU64,
    cache_flushes: AtomicU64,
    reclaims: AtomicU64,
}

/// Device counters for health reporting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeviceStats {
    pub label: String,
    #[serde(flatten)]
    pub pool: PoolStats,
    pub syncs: u64,
    pub cache_flushes: u64,
    pub reclaims: u64,
}

impl DeviceContext {
    pub fn new(config: DeviceConfig) -> Self {
        tracing::info!(
            device = %config.label,
            capacity_mb = config.capacity_bytes / (1024 * 1024),
            "initializing device context"
        );
        Self {
            label: config.label,
            pool: MemoryPool::new(config.capacity_bytes),
            syncs: AtomicU64::new(0),
            cache_flushes: AtomicU64::new(0),
            reclaims: AtomicU64::new(0),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn alloc(&self, len: usize) -> Result<DeviceBuffer> {
        self.pool.alloc(len)
    }

    pub fn capacity(&self) -> u64 {
        self.pool.capacity()
    }

    pub fn allocated(&self) -> u64 {
        self.pool.allocated()
    }

    /// Occupancy estimate: live allocations plus cached blocks.
    pub fn occupancy(&self) -> u64 {
        self.pool.reserved()
    }

    /// Wait for outstanding device work. Host-backed memory has no queued
    /// work, so this only records the barrier.
    pub fn synchronize(&self) -> Result<()> {
        self.syncs.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Return cached free blocks to the device. Returns bytes released.
    pub fn empty_cache(&self) -> u64 {
        self.cache_flushes.fetch_add(1, Ordering::Relaxed);
        let released = self.pool.empty_cache();
        metrics::gauge!("ocrgate_device_reserved_bytes").set(self.occupancy() as f64);
        released
    }

    /// Forced reclaim pass after an out-of-memory signal: synchronize, then
    /// drop the whole allocator cache.
    pub fn reclaim(&self) -> Result<u64> {
        self.reclaims.fetch_add(1, Ordering::Relaxed);
        self.synchronize()?;
        let released = self.empty_cache();
        tracing::debug!(
            device = %self.label,
            released,
            allocated = self.allocated(),
            "device memory reclaimed"
        );
        Ok(released)
    }

    pub fn stats(&self) -> DeviceStats {
        DeviceStats {
            label: self.label.clone(),
            pool: self.pool.stats(),
            syncs: self.syncs.load(Ordering::Relaxed),
            cache_flushes: self.cache_flushes.load(Ordering::Relaxed),
            reclaims: self.reclaims.load(Ordering::Relaxed),
        }
    }
}
