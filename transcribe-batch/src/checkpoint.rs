// checkpoint.rs
//
// Durable batch progress. One canonical JSON file per directory, replaced
// atomically on every save so a crash never leaves a half-written checkpoint.

use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

use crate::batch::{BatchStats, FailedJob};
use crate::config::BatchConfig;
use crate::utils::write_atomic;

pub const CHECKPOINT_FILE: &str = "batch_checkpoint.json";

/// On-disk projection of a batch run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    #[serde(rename = "batchID")]
    pub batch_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "processedFiles")]
    pub processed: Vec<String>,
    #[serde(rename = "failedFiles")]
    pub failed: Vec<FailedJob>,
    #[serde(rename = "remainingFiles")]
    pub remaining: Vec<String>,
    pub stats: BatchStats,
}

/// Summary of a batch that can be picked up again
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeInfo {
    pub batch_id: String,
    pub processed_count: usize,
    pub failed_count: usize,
    pub remaining_count: usize,
    pub remaining: Vec<String>,
}

/// Checkpoint persistence. Every operation reports failure as `false`/`None`
/// and logs it; IO errors never escape to the caller.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let path = dir.join(CHECKPOINT_FILE);
        Self { dir, path }
    }

    pub fn from_config(config: &BatchConfig) -> Self {
        Self::new(config.resolved_checkpoint_dir())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn save(
        &self,
        batch_id: &str,
        processed: &[String],
        failed: &[FailedJob],
        remaining: &[String],
        stats: &BatchStats,
    ) -> bool {
        let record = CheckpointRecord {
            batch_id: batch_id.to_string(),
            timestamp: Utc::now(),
            processed: processed.to_vec(),
            failed: failed.to_vec(),
            remaining: remaining.to_vec(),
            stats: stats.clone(),
        };
        self.save_record(&record)
    }

    pub fn save_record(&self, record: &CheckpointRecord) -> bool {
        match self.try_save(record) {
            Ok(()) => {
                info!(
                    "Checkpoint saved: {} processed, {} failed, {} remaining",
                    record.processed.len(),
                    record.failed.len(),
                    record.remaining.len()
                );
                true
            }
            Err(e) => {
                error!("Failed to save checkpoint to {}: {}", self.path.display(), e);
                false
            }
        }
    }

    fn try_save(&self, record: &CheckpointRecord) -> io::Result<()> {
        let bytes = serde_json::to_vec_pretty(record)?;
        write_atomic(&self.path, &bytes)
    }

    /// Read the checkpoint; with `batch_id`, only a matching run is returned
    pub fn load(&self, batch_id: Option<&str>) -> Option<CheckpointRecord> {
        let raw = match std::fs::read(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("No checkpoint at {}", self.path.display());
                return None;
            }
            Err(e) => {
                error!("Failed to read checkpoint {}: {}", self.path.display(), e);
                return None;
            }
        };

        let record: CheckpointRecord = match serde_json::from_slice(&raw) {
            Ok(record) => record,
            Err(e) => {
                warn!("Ignoring unreadable checkpoint {}: {}", self.path.display(), e);
                return None;
            }
        };

        if record.batch_id.is_empty() {
            warn!("Ignoring checkpoint without a batch id");
            return None;
        }

        if let Some(expected) = batch_id {
            if record.batch_id != expected {
                warn!(
                    "Checkpoint batch_id mismatch: {} != {}",
                    record.batch_id, expected
                );
                return None;
            }
        }

        info!(
            "Checkpoint loaded: {} files processed, {} remaining",
            record.processed.len(),
            record.remaining.len()
        );
        Some(record)
    }

    pub fn clear(&self) -> bool {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                info!("Checkpoint cleared");
                true
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => true,
            Err(e) => {
                error!("Failed to clear checkpoint {}: {}", self.path.display(), e);
                false
            }
        }
    }

    /// Resumable batch, or None when there is nothing left to do
    pub fn resume_info(&self) -> Option<ResumeInfo> {
        let record = self.load(None)?;
        if record.remaining.is_empty() {
            return None;
        }

        Some(ResumeInfo {
            batch_id: record.batch_id,
            processed_count: record.processed.len(),
            failed_count: record.failed.len(),
            remaining_count: record.remaining.len(),
            remaining: record.remaining,
        })
    }

    pub fn can_resume(&self) -> bool {
        self.resume_info().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn sample_stats() -> BatchStats {
        BatchStats {
            total_jobs: 4,
            processed_count: 2,
            failed_count: 1,
            start_time: Some(Utc::now()),
            current_worker_count: 2,
            memory_usage_mb: 128.5,
            ..BatchStats::default()
        }
    }

    fn failed(file: &str) -> FailedJob {
        FailedJob {
            file: file.to_string(),
            error: "decoder crashed".to_string(),
            kind: Some(ErrorKind::Permanent),
            timestamp: Utc::now(),
        }
    }

    fn ids(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_save_then_load_reproduces_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let processed = ids(&["a.wav", "b.wav"]);
        let failures = vec![failed("c.wav")];
        let remaining = ids(&["d.wav"]);
        let stats = sample_stats();

        assert!(store.save("batch_1", &processed, &failures, &remaining, &stats));

        let record = store.load(Some("batch_1")).expect("checkpoint should load");
        assert_eq!(record.batch_id, "batch_1");
        assert_eq!(record.processed, processed);
        assert_eq!(record.failed, failures);
        assert_eq!(record.remaining, remaining);
        assert_eq!(record.stats, stats);
    }

    #[test]
    fn test_on_disk_field_names() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        assert!(store.save("b", &ids(&["x"]), &[failed("y")], &ids(&["z"]), &sample_stats()));

        let raw = std::fs::read_to_string(store.path()).unwrap();
        let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(json["batchID"], "b");
        assert!(json["timestamp"].is_string());
        assert_eq!(json["processedFiles"][0], "x");
        assert_eq!(json["failedFiles"][0]["file"], "y");
        assert_eq!(json["failedFiles"][0]["error"], "decoder crashed");
        assert!(json["failedFiles"][0]["timestamp"].is_string());
        assert_eq!(json["remainingFiles"][0], "z");
        assert!(json["stats"].is_object());
    }

    #[test]
    fn test_mismatched_batch_id_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        assert!(store.save("batch_1", &[], &[], &ids(&["a"]), &sample_stats()));

        assert!(store.load(Some("batch_2")).is_none());
        assert!(store.load(None).is_some());
    }

    #[test]
    fn test_corrupted_file_is_treated_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        std::fs::write(store.path(), b"{\"batchID\": \"half").unwrap();

        assert!(store.load(None).is_none());
        assert!(store.resume_info().is_none());
    }

    #[test]
    fn test_failed_save_keeps_previous_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        assert!(store.save("batch_1", &[], &[], &ids(&["a"]), &sample_stats()));

        // A store whose directory path is occupied by a regular file cannot write
        let blocker = dir.path().join("blocked");
        std::fs::write(&blocker, b"file").unwrap();
        let broken = CheckpointStore::new(&blocker);
        assert!(!broken.save("batch_2", &[], &[], &[], &sample_stats()));

        assert_eq!(store.load(None).unwrap().batch_id, "batch_1");
    }

    #[test]
    fn test_clear_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        assert!(store.save("batch_1", &[], &[], &ids(&["a"]), &sample_stats()));

        assert!(store.clear());
        assert!(!store.path().exists());
        assert!(store.clear());
    }

    #[test]
    fn test_resume_info_requires_remaining_work() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        assert!(store.resume_info().is_none());

        assert!(store.save("done", &ids(&["a"]), &[], &[], &sample_stats()));
        assert!(store.resume_info().is_none());
        assert!(!store.can_resume());

        assert!(store.save("todo", &ids(&["a"]), &[failed("b")], &ids(&["c", "d"]), &sample_stats()));
        let info = store.resume_info().unwrap();
        assert_eq!(info.batch_id, "todo");
        assert_eq!(info.processed_count, 1);
        assert_eq!(info.failed_count, 1);
        assert_eq!(info.remaining_count, 2);
        assert_eq!(info.remaining, ids(&["c", "d"]));
    }
}
