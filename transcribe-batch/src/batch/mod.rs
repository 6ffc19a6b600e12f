pub mod orchestrator;
pub mod retry;
pub mod stats;

pub use orchestrator::{next_worker_count, BatchOrchestrator};
pub use retry::RetryPolicy;
pub use stats::{
    BatchEvent, BatchProgress, BatchReport, BatchState, BatchStats, FailedJob, JobFn,
    ProgressCallback,
};
