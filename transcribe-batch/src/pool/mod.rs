pub mod lease;
pub mod resource_pool;

pub use lease::PoolLease;
pub use resource_pool::{Closeable, EntrySnapshot, Loader, PoolConfig, PoolStats, ResourcePool};
