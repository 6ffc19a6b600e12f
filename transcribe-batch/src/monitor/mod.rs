pub mod probe;
pub mod resource_monitor;

pub use probe::{ResourceUsage, StaticProbe, SysinfoProbe, UsageProbe};
pub use resource_monitor::{MemoryLevel, ResourceMonitor};
