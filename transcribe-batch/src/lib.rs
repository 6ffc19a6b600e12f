// Performance optimization: Conditional logging macros for hot paths
#[cfg(debug_assertions)]
macro_rules! perf_debug {
    ($($arg:tt)*) => {
        log::debug!($($arg)*)
    };
}

#[cfg(not(debug_assertions))]
macro_rules! perf_debug {
    ($($arg:tt)*) => {};
}

#[cfg(debug_assertions)]
macro_rules! perf_trace {
    ($($arg:tt)*) => {
        log::trace!($($arg)*)
    };
}

#[cfg(not(debug_assertions))]
macro_rules! perf_trace {
    ($($arg:tt)*) => {};
}

// Make these macros available to other modules
pub(crate) use perf_debug;
pub(crate) use perf_trace;

pub mod batch;
pub mod checkpoint;
pub mod config;
pub mod engine;
pub mod error;
pub mod monitor;
pub mod pipeline;
pub mod pool;
pub mod utils;

pub use batch::{
    BatchEvent, BatchOrchestrator, BatchProgress, BatchReport, BatchState, BatchStats, FailedJob,
    JobFn, ProgressCallback, RetryPolicy,
};
pub use checkpoint::{CheckpointRecord, CheckpointStore, ResumeInfo};
pub use config::BatchConfig;
pub use engine::{InferenceModel, SingleFlightGate};
pub use error::{BatchError, ConfigError, ErrorKind, GateError, JobError, PoolError};
pub use monitor::{MemoryLevel, ResourceMonitor, ResourceUsage, StaticProbe, SysinfoProbe, UsageProbe};
pub use pipeline::{AudioInput, FileValidator, Transcript, TranscriptOutput, TranscriptionPipeline};
pub use pool::{Closeable, PoolConfig, PoolLease, PoolStats, ResourcePool};
