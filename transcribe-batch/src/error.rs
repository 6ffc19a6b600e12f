// error.rs
//
// Error taxonomy shared by every component. Failures are classified by the
// layer that produces them, so callers read `ErrorKind` instead of inspecting
// messages.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use thiserror::Error;

// ============================================================================
// PER-JOB ERRORS
// ============================================================================

/// Failure category attached to every job error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Worth retrying after a short delay (timeouts, interrupted IO)
    Transient,
    /// Environment problem: memory, disk, permissions, model loading
    Resource,
    /// Retrying will not help (bad input, unsupported format)
    Permanent,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Transient => "transient",
            Self::Resource => "resource",
            Self::Permanent => "permanent",
        };
        f.write_str(label)
    }
}

/// Structured failure returned by a job function
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{detail}")]
pub struct JobError {
    pub kind: ErrorKind,
    pub detail: String,
}

impl JobError {
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    pub fn transient(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, detail)
    }

    pub fn resource(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Resource, detail)
    }

    pub fn permanent(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Permanent, detail)
    }

    pub fn is_retryable(&self) -> bool {
        self.kind == ErrorKind::Transient
    }

    /// Classify an IO error by its kind, prefixing the message with context
    pub fn from_io(context: impl fmt::Display, err: &io::Error) -> Self {
        let kind = match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock => {
                ErrorKind::Transient
            }
            io::ErrorKind::PermissionDenied | io::ErrorKind::OutOfMemory => ErrorKind::Resource,
            io::ErrorKind::NotFound | io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData => {
                ErrorKind::Permanent
            }
            // Disk-full and similar platform errors surface as `Other`/uncategorized
            _ => ErrorKind::Resource,
        };
        Self::new(kind, format!("{}: {}", context, err))
    }
}

// ============================================================================
// COMPONENT ERRORS
// ============================================================================

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("resource pool has been shut down")]
    ShutDown,
    #[error("no loader available for '{0}'")]
    NoLoader(String),
    #[error("failed to load '{key}': {source}")]
    LoadFailed {
        key: String,
        #[source]
        source: anyhow::Error,
    },
}

#[derive(Debug, Error)]
pub enum GateError {
    #[error("failed to load guarded resource: {0}")]
    LoadFailed(#[source] anyhow::Error),
    #[error("gate '{0}' was closed and will not reload")]
    Closed(String),
    #[error("gate '{0}' re-entered from inside its own exclusive section")]
    Reentrant(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for `{field}`: {reason}")]
    InvalidValue { field: &'static str, reason: String },
    #[error("failed to read config file: {0}")]
    Read(#[from] io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field,
            reason: reason.into(),
        }
    }
}

/// Orchestration-level failures, fatal to one `process` call only
#[derive(Debug, Clone, Error)]
pub enum BatchError {
    #[error("a batch is already running on this orchestrator")]
    AlreadyRunning,
    #[error("worker pool failure: {0}")]
    WorkerPool(String),
}

impl From<PoolError> for JobError {
    fn from(err: PoolError) -> Self {
        JobError::resource(err.to_string())
    }
}

impl From<GateError> for JobError {
    fn from(err: GateError) -> Self {
        match err {
            GateError::Reentrant(_) => JobError::permanent(err.to_string()),
            GateError::LoadFailed(_) | GateError::Closed(_) => JobError::resource(err.to_string()),
        }
    }
}
