use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::batch::RetryPolicy;
use crate::error::ConfigError;
use crate::pool::PoolConfig;

/// Directory name used under the platform data dir for checkpoints
const APP_DIR_NAME: &str = "transcribe-batch";

/// Batch processing configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub max_workers: usize,              // Upper bound for the dynamic worker count
    pub auto_adjust_workers: bool,       // Grow/shrink workers from live resource usage
    pub memory_limit_mb: u64,            // Process memory ceiling
    pub enable_checkpoint: bool,         // Persist progress for crash recovery
    pub checkpoint_interval_jobs: usize, // Extra save every N completions within a window
    pub checkpoint_dir: Option<PathBuf>, // None = platform data dir
    pub max_pooled_models: usize,        // Max models kept loaded at once
    pub idle_timeout_secs: u64,          // Unload models idle longer than this
    pub sweep_interval_secs: u64,        // How often the idle sweep runs
    pub max_retries: u32,                // Retries for transient job failures
    pub retry_delay_ms: u64,             // First retry delay, doubled per attempt
    pub max_retry_delay_ms: u64,         // Backoff ceiling
    pub pause_poll_ms: u64,              // Poll interval while paused
    pub monitor_interval_ms: u64,        // Background resource sampling interval
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            auto_adjust_workers: true,
            memory_limit_mb: 4096,
            enable_checkpoint: true,
            checkpoint_interval_jobs: 10,
            checkpoint_dir: None,
            max_pooled_models: 2,
            idle_timeout_secs: 300, // 5 minutes
            sweep_interval_secs: 60,
            max_retries: 2,
            retry_delay_ms: 1000,
            max_retry_delay_ms: 60_000,
            pause_poll_ms: 500,
            monitor_interval_ms: 1000,
        }
    }
}

impl BatchConfig {
    /// Load a JSON config file; missing fields take their defaults
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        info!("Loaded batch config from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_workers == 0 {
            return Err(ConfigError::invalid("max_workers", "must be at least 1"));
        }
        if self.memory_limit_mb == 0 {
            return Err(ConfigError::invalid("memory_limit_mb", "must be greater than 0"));
        }
        if self.max_pooled_models == 0 {
            return Err(ConfigError::invalid("max_pooled_models", "must be at least 1"));
        }
        if self.checkpoint_interval_jobs == 0 {
            return Err(ConfigError::invalid(
                "checkpoint_interval_jobs",
                "must be at least 1",
            ));
        }
        if self.sweep_interval_secs == 0 {
            return Err(ConfigError::invalid("sweep_interval_secs", "must be greater than 0"));
        }
        if self.pause_poll_ms == 0 {
            return Err(ConfigError::invalid("pause_poll_ms", "must be greater than 0"));
        }
        if self.monitor_interval_ms == 0 {
            return Err(ConfigError::invalid("monitor_interval_ms", "must be greater than 0"));
        }
        if self.retry_delay_ms > self.max_retry_delay_ms {
            return Err(ConfigError::invalid(
                "retry_delay_ms",
                format!(
                    "{} exceeds max_retry_delay_ms ({})",
                    self.retry_delay_ms, self.max_retry_delay_ms
                ),
            ));
        }
        Ok(())
    }

    /// Checkpoint directory, falling back to the platform data dir
    pub fn resolved_checkpoint_dir(&self) -> PathBuf {
        if let Some(dir) = &self.checkpoint_dir {
            return dir.clone();
        }

        match dirs::data_dir().or_else(dirs::home_dir) {
            Some(base) => base.join(APP_DIR_NAME),
            None => {
                warn!("Could not find system data directory, using ./{}", APP_DIR_NAME);
                PathBuf::from(APP_DIR_NAME)
            }
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_entries: self.max_pooled_models,
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            sweep_interval: Duration::from_secs(self.sweep_interval_secs),
            auto_unload: true,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.retry_delay_ms),
            max_delay: Duration::from_millis(self.max_retry_delay_ms),
        }
    }

    pub fn pause_poll_interval(&self) -> Duration {
        Duration::from_millis(self.pause_poll_ms)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = BatchConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_workers, 4);
        assert_eq!(config.pool_config().idle_timeout, Duration::from_secs(300));
    }

    #[test]
    fn test_zero_workers_rejected() {
        let config = BatchConfig {
            max_workers: 0,
            ..BatchConfig::default()
        };
        match config.validate() {
            Err(ConfigError::InvalidValue { field, .. }) => assert_eq!(field, "max_workers"),
            other => panic!("expected invalid max_workers, got {:?}", other),
        }
    }

    #[test]
    fn test_retry_delay_above_ceiling_rejected() {
        let config = BatchConfig {
            retry_delay_ms: 5000,
            max_retry_delay_ms: 1000,
            ..BatchConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("batch.json");
        std::fs::write(&path, r#"{ "max_workers": 3, "checkpoint_dir": "/tmp/ckpt" }"#).unwrap();

        let config = BatchConfig::from_json_file(&path).unwrap();
        assert_eq!(config.max_workers, 3);
        assert_eq!(config.memory_limit_mb, 4096);
        assert_eq!(config.resolved_checkpoint_dir(), PathBuf::from("/tmp/ckpt"));
    }

    #[test]
    fn test_invalid_json_file_reports_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("batch.json");
        std::fs::write(&path, "{ not json").unwrap();

        assert!(matches!(
            BatchConfig::from_json_file(&path),
            Err(ConfigError::Parse(_))
        ));
    }
}
