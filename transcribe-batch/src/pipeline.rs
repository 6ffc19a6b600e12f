// pipeline.rs
//
// Reference job function: validate the file, borrow the shared model from the
// pool, run inference inside the model's gate, then clean and write the text
// outside of it so only inference is serialised.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::batch::JobFn;
use crate::engine::{InferenceModel, SingleFlightGate};
use crate::error::JobError;
use crate::monitor::ResourceMonitor;
use crate::pool::ResourcePool;
use crate::utils::write_atomic;

/// Audio and video containers the decoder accepts
pub const SUPPORTED_EXTENSIONS: &[&str] = &[
    "mp3", "wav", "m4a", "flac", "ogg", "aac", "wma", "opus", "amr", "mp4", "avi", "mov", "mkv",
    "3gp", "webm",
];

/// A job file that passed validation
#[derive(Debug, Clone, PartialEq)]
pub struct AudioInput {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub format: String, // Lowercased extension
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transcript {
    pub text: String,
    pub language: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptOutput {
    pub source: String,
    pub output_path: Option<PathBuf>,
    pub characters: usize,
    pub language: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct FileValidator {
    max_file_bytes: Option<u64>,
}

impl FileValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_file_size_mb(mut self, max_mb: u64) -> Self {
        self.max_file_bytes = Some(max_mb.saturating_mul(1024 * 1024));
        self
    }

    pub fn is_supported(path: &Path) -> bool {
        extension_of(path)
            .map(|ext| SUPPORTED_EXTENSIONS.contains(&ext.as_str()))
            .unwrap_or(false)
    }

    /// Check that `job_id` names a readable, non-empty media file
    pub fn validate(&self, job_id: &str) -> Result<AudioInput, JobError> {
        let path = PathBuf::from(job_id);
        let metadata =
            std::fs::metadata(&path).map_err(|e| JobError::from_io(path.display(), &e))?;

        if !metadata.is_file() {
            return Err(JobError::permanent(format!(
                "not a regular file: {}",
                path.display()
            )));
        }

        let format = extension_of(&path).unwrap_or_default();
        if !SUPPORTED_EXTENSIONS.contains(&format.as_str()) {
            return Err(JobError::permanent(format!(
                "unsupported file format '.{}': {}",
                format,
                path.display()
            )));
        }

        let size_bytes = metadata.len();
        if size_bytes == 0 {
            return Err(JobError::permanent(format!("file is empty: {}", path.display())));
        }
        if let Some(max) = self.max_file_bytes {
            if size_bytes > max {
                return Err(JobError::permanent(format!(
                    "file too large ({} bytes > {} bytes): {}",
                    size_bytes,
                    max,
                    path.display()
                )));
            }
        }

        // Metadata can succeed on files we may not open
        File::open(&path).map_err(|e| JobError::from_io(path.display(), &e))?;

        Ok(AudioInput {
            path,
            size_bytes,
            format,
        })
    }
}

fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
}

/// Collapse whitespace, drop immediate word repeats and tidy punctuation spacing
pub fn clean_transcript(text: &str) -> String {
    let mut words: Vec<&str> = Vec::new();
    for word in text.split_whitespace() {
        let repeated = words
            .last()
            .map(|last| last.eq_ignore_ascii_case(word))
            .unwrap_or(false);
        if !repeated {
            words.push(word);
        }
    }

    let mut cleaned = words.join(" ");
    for (spaced, tight) in [(" .", "."), (" ,", ","), (" ?", "?"), (" !", "!")] {
        cleaned = cleaned.replace(spaced, tight);
    }
    cleaned
}

type ModelLoader<M> = Arc<dyn Fn(&str) -> anyhow::Result<M> + Send + Sync>;

pub struct TranscriptionPipeline<M>
where
    M: InferenceModel<Input = AudioInput, Output = Transcript>,
{
    pool: Arc<ResourcePool<SingleFlightGate<M>>>,
    model_key: String,
    model_loader: ModelLoader<M>,
    validator: FileValidator,
    output_dir: Option<PathBuf>,
}

impl<M> TranscriptionPipeline<M>
where
    M: InferenceModel<Input = AudioInput, Output = Transcript>,
{
    pub fn new<F>(
        pool: Arc<ResourcePool<SingleFlightGate<M>>>,
        model_key: impl Into<String>,
        model_loader: F,
    ) -> Self
    where
        F: Fn(&str) -> anyhow::Result<M> + Send + Sync + 'static,
    {
        Self {
            pool,
            model_key: model_key.into(),
            model_loader: Arc::new(model_loader),
            validator: FileValidator::default(),
            output_dir: None,
        }
    }

    pub fn with_validator(mut self, validator: FileValidator) -> Self {
        self.validator = validator;
        self
    }

    /// Write `<stem>.txt` per job into `dir`
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    pub fn pool(&self) -> &Arc<ResourcePool<SingleFlightGate<M>>> {
        &self.pool
    }

    /// Transcribe one file. Safe to repeat: the output is replaced atomically.
    pub fn run(&self, job_id: &str) -> Result<TranscriptOutput, JobError> {
        let input = self.validator.validate(job_id)?;
        debug!("Validated {} ({} bytes, {})", job_id, input.size_bytes, input.format);

        let transcript = {
            let loader = Arc::clone(&self.model_loader);
            let lease = self.pool.checkout(&self.model_key, move |key| {
                let key = key.to_string();
                let gate = SingleFlightGate::new(key.clone(), move || loader(&key));
                // Fail the checkout rather than the first inference
                gate.ensure_loaded()?;
                Ok(gate)
            })?;
            lease.infer(input)?
        };

        let text = clean_transcript(&transcript.text);
        if text.is_empty() {
            return Err(JobError::permanent(format!("no speech recognized in {}", job_id)));
        }

        let output_path = match &self.output_dir {
            Some(dir) => Some(self.write_output(dir, job_id, &text)?),
            None => None,
        };

        info!("Transcribed {} ({} chars)", job_id, text.chars().count());
        Ok(TranscriptOutput {
            source: job_id.to_string(),
            output_path,
            characters: text.chars().count(),
            language: transcript.language,
        })
    }

    fn write_output(&self, dir: &Path, job_id: &str, text: &str) -> Result<PathBuf, JobError> {
        let stem = Path::new(job_id)
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .ok_or_else(|| JobError::permanent(format!("cannot derive output name for {}", job_id)))?;
        let path = dir.join(format!("{}.txt", stem));

        write_atomic(&path, text.as_bytes()).map_err(|e| JobError::from_io(path.display(), &e))?;
        Ok(path)
    }

    /// Adapt the pipeline to the orchestrator's job function signature
    pub fn into_job_fn(self: Arc<Self>) -> JobFn<TranscriptOutput> {
        Arc::new(move |job_id: &str| self.run(job_id))
    }

    /// Unload every model nobody is using right now
    pub fn relieve_memory_pressure(&self) -> usize {
        self.pool.evict_inactive()
    }

    /// Unload idle models whenever `monitor` reports memory above its limit
    pub fn attach_to_monitor(&self, monitor: &ResourceMonitor) {
        let pool = Arc::downgrade(&self.pool);
        monitor.register_pressure_hook(move || {
            if let Some(pool) = pool.upgrade() {
                pool.evict_inactive();
            }
        });
    }
}
