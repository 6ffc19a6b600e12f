use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, JobError};

/// The caller's unit of work: job id in, payload or structured failure out
pub type JobFn<T> = Arc<dyn Fn(&str) -> Result<T, JobError> + Send + Sync>;

/// Invoked after every completed job with a snapshot of the aggregate stats
pub type ProgressCallback = Arc<dyn Fn(&BatchStats) + Send + Sync>;

/// One terminal failure, as stored in `failedFiles`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedJob {
    pub file: String,
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
    pub timestamp: DateTime<Utc>,
}

impl FailedJob {
    pub fn new(file: &str, error: &JobError) -> Self {
        Self {
            file: file.to_string(),
            error: error.to_string(),
            kind: Some(error.kind),
            timestamp: Utc::now(),
        }
    }
}

/// Aggregate counters. Counts include jobs restored from a checkpoint.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BatchStats {
    pub total_jobs: usize,
    pub processed_count: usize,
    pub failed_count: usize,
    pub start_time: Option<DateTime<Utc>>,
    pub elapsed_secs: f64,
    pub estimated_remaining_secs: f64,
    pub current_worker_count: usize,
    pub memory_usage_mb: f64,
}

impl BatchStats {
    pub fn completed(&self) -> usize {
        self.processed_count + self.failed_count
    }

    pub fn remaining(&self) -> usize {
        self.total_jobs.saturating_sub(self.completed())
    }

    pub fn progress_percent(&self) -> f64 {
        if self.total_jobs == 0 {
            return 100.0;
        }
        self.completed() as f64 / self.total_jobs as f64 * 100.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    Idle,
    Running,
    Paused,
    Completed,
    Cancelled,
    Failed,
}

impl BatchState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }
}

/// Consistent progress snapshot for UIs and the CLI
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchProgress {
    pub processed_count: usize,
    pub failed_count: usize,
    pub remaining_count: usize,
    pub progress_percent: f64,
    pub estimated_remaining_secs: f64,
    pub current_worker_count: usize,
    pub memory_usage_mb: f64,
    pub state: BatchState,
    pub elapsed_secs: f64,
}

/// Outcome of one `process` call
#[derive(Debug, Clone)]
pub struct BatchReport<T> {
    pub batch_id: String,
    pub success: bool,
    pub state: BatchState,
    pub processed: Vec<String>,
    pub failed: Vec<FailedJob>,
    pub results: HashMap<String, T>, // Only jobs completed in this session
    pub stats: BatchStats,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BatchEvent {
    Started {
        batch_id: String,
        total_jobs: usize,
        resumed: bool,
    },
    JobCompleted {
        job_id: String,
        attempts: u32,
    },
    JobFailed {
        job_id: String,
        error: String,
        kind: ErrorKind,
    },
    WorkersAdjusted {
        from: usize,
        to: usize,
    },
    CheckpointSaved {
        processed: usize,
        failed: usize,
        remaining: usize,
    },
    Paused,
    Resumed,
    Cancelled,
    Finished {
        batch_id: String,
        state: BatchState,
        processed: usize,
        failed: usize,
    },
}
