pub mod buffer;
pub mod context;
pub mod memory;

pub use buffer::DeviceBuffer;
pub use context::{DeviceConfig, DeviceContext, DeviceStats};
pub use memory::{MemoryPool, PoolStats};
