use std::collections::{HashMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{Local, Utc};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;

use super::retry::{run_job, JobOutcome, RetryPolicy};
use super::stats::{
    BatchEvent, BatchProgress, BatchReport, BatchState, BatchStats, FailedJob, JobFn,
    ProgressCallback,
};
use crate::checkpoint::{CheckpointRecord, CheckpointStore};
use crate::config::BatchConfig;
use crate::error::BatchError;
use crate::monitor::{ResourceMonitor, ResourceUsage};

/// Shrink one step when memory is above this share of the limit
const SHRINK_MEMORY_RATIO: f64 = 0.8;
/// Grow one step only below this share of the limit...
const GROW_MEMORY_RATIO: f64 = 0.5;
/// ...and below this CPU usage
const GROW_CPU_PERCENT: f32 = 50.0;

/// Window size per worker
const WINDOW_PER_WORKER: usize = 2;

/// Next worker count: at most one step away from `current`, within `[1, max]`
pub fn next_worker_count(current: usize, max: usize, usage: ResourceUsage, limit_mb: f64) -> usize {
    let max = max.max(1);
    let current = current.clamp(1, max);

    if usage.memory_mb > limit_mb * SHRINK_MEMORY_RATIO {
        current.saturating_sub(1).max(1)
    } else if usage.cpu_percent < GROW_CPU_PERCENT && usage.memory_mb < limit_mb * GROW_MEMORY_RATIO {
        (current + 1).min(max)
    } else {
        current
    }
}

struct RunState {
    batch_id: String,
    processed: Vec<String>,
    failed: Vec<FailedJob>,
    remaining: Vec<String>, // Pending and in-flight, in submission order
    stats: BatchStats,
    state: BatchState,
    session_started: Option<Instant>,
    session_completed: usize,
    since_checkpoint: usize,
}

impl RunState {
    fn idle() -> Self {
        Self {
            batch_id: String::new(),
            processed: Vec::new(),
            failed: Vec::new(),
            remaining: Vec::new(),
            stats: BatchStats::default(),
            state: BatchState::Idle,
            session_started: None,
            session_completed: 0,
            since_checkpoint: 0,
        }
    }

    fn refresh_timing(&mut self) {
        let elapsed = self
            .session_started
            .map(|started| started.elapsed().as_secs_f64())
            .unwrap_or(0.0);
        self.stats.elapsed_secs = elapsed;
        self.stats.estimated_remaining_secs = if self.session_completed > 0 {
            elapsed / self.session_completed as f64 * self.remaining.len() as f64
        } else {
            0.0
        };
    }

    fn to_record(&self) -> CheckpointRecord {
        CheckpointRecord {
            batch_id: self.batch_id.clone(),
            timestamp: Utc::now(),
            processed: self.processed.clone(),
            failed: self.failed.clone(),
            remaining: self.remaining.clone(),
            stats: self.stats.clone(),
        }
    }
}

/// Resets the single-run flag however `process` exits
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

type WindowResult<T> = Result<(String, Option<JobOutcome<T>>), BatchError>;

/// Runs job batches in bounded windows with adaptive parallelism,
/// checkpointing progress so an interrupted batch can be resumed.
pub struct BatchOrchestrator {
    config: BatchConfig,
    retry: RetryPolicy,
    monitor: Arc<ResourceMonitor>,
    checkpoint: Option<CheckpointStore>,
    run: Mutex<RunState>,
    workers: AtomicUsize,
    paused: AtomicBool,
    cancelled: Arc<AtomicBool>,
    running: AtomicBool,
    event_sender: mpsc::UnboundedSender<BatchEvent>,
    #[cfg(test)]
    window_fault: Mutex<Option<usize>>, // Windows left before a simulated pool failure
}

impl BatchOrchestrator {
    pub fn new(
        config: BatchConfig,
        monitor: Arc<ResourceMonitor>,
        checkpoint: Option<CheckpointStore>,
    ) -> (Self, mpsc::UnboundedReceiver<BatchEvent>) {
        let (event_sender, event_receiver) = mpsc::unbounded_channel();

        let checkpoint = checkpoint.filter(|_| config.enable_checkpoint);
        if checkpoint.is_none() {
            info!("Checkpointing disabled for this orchestrator");
        }

        let max_workers = config.max_workers.max(1);
        let orchestrator = Self {
            retry: config.retry_policy(),
            monitor,
            checkpoint,
            run: Mutex::new(RunState::idle()),
            workers: AtomicUsize::new(max_workers),
            paused: AtomicBool::new(false),
            cancelled: Arc::new(AtomicBool::new(false)),
            running: AtomicBool::new(false),
            event_sender,
            config,
            #[cfg(test)]
            window_fault: Mutex::new(None),
        };

        info!(
            "Batch orchestrator initialized: max_workers={}, auto_adjust={}, memory_limit={}MB",
            max_workers, orchestrator.config.auto_adjust_workers, orchestrator.config.memory_limit_mb
        );
        (orchestrator, event_receiver)
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Process `jobs`, resuming from a checkpoint saved under the same batch id.
    ///
    /// Individual job failures never fail the call: they land in
    /// `report.failed`. `success` is false only when the run was cancelled or
    /// the worker pool itself broke.
    pub async fn process<T: Send + 'static>(
        &self,
        jobs: Vec<String>,
        job_fn: JobFn<T>,
        progress: Option<ProgressCallback>,
        batch_id: Option<String>,
    ) -> BatchReport<T> {
        if self.running.swap(true, Ordering::AcqRel) {
            warn!("Rejected batch: another batch is running on this orchestrator");
            return self.rejected_report(batch_id.unwrap_or_default(), BatchError::AlreadyRunning);
        }
        let _running = RunningGuard(&self.running);

        self.cancelled.store(false, Ordering::Release);
        self.paused.store(false, Ordering::Release);

        let batch_id =
            batch_id.unwrap_or_else(|| format!("batch_{}", Local::now().format("%Y%m%d_%H%M%S")));
        self.begin_run(&batch_id, jobs);

        let mut results = HashMap::new();
        let outcome = self.run_windows(&job_fn, progress.as_ref(), &mut results).await;

        self.finish_run(outcome, results)
    }

    fn begin_run(&self, batch_id: &str, jobs: Vec<String>) {
        let mut seen = HashSet::with_capacity(jobs.len());
        let jobs: Vec<String> = jobs.into_iter().filter(|id| seen.insert(id.clone())).collect();

        let restored = self
            .checkpoint
            .as_ref()
            .and_then(|store| store.load(Some(batch_id)));

        let mut run = RunState::idle();
        run.batch_id = batch_id.to_string();
        run.state = BatchState::Running;
        run.session_started = Some(Instant::now());

        let resumed = restored.is_some();
        match restored {
            Some(record) => {
                let mut known: HashSet<String> = record.processed.iter().cloned().collect();
                known.extend(record.failed.iter().map(|f| f.file.clone()));
                known.extend(record.remaining.iter().cloned());

                run.remaining = record.remaining;
                run.remaining.extend(jobs.into_iter().filter(|id| !known.contains(id)));
                run.processed = record.processed;
                run.failed = record.failed;
                run.stats.start_time = record.stats.start_time.or_else(|| Some(Utc::now()));

                info!(
                    "Resuming batch {}: {} processed, {} failed, {} remaining",
                    batch_id,
                    run.processed.len(),
                    run.failed.len(),
                    run.remaining.len()
                );
            }
            None => {
                run.remaining = jobs;
                run.stats.start_time = Some(Utc::now());
                info!("Starting batch {} with {} jobs", batch_id, run.remaining.len());
            }
        }

        let workers = self.config.max_workers.max(1);
        self.workers.store(workers, Ordering::Release);

        run.stats.processed_count = run.processed.len();
        run.stats.failed_count = run.failed.len();
        run.stats.total_jobs = run.processed.len() + run.failed.len() + run.remaining.len();
        run.stats.current_worker_count = workers;
        run.stats.memory_usage_mb = self.monitor.latest().map(|u| u.memory_mb).unwrap_or(0.0);

        let total_jobs = run.stats.total_jobs;
        *self.run.lock() = run;

        self.emit(BatchEvent::Started {
            batch_id: batch_id.to_string(),
            total_jobs,
            resumed,
        });
    }

    async fn run_windows<T: Send + 'static>(
        &self,
        job_fn: &JobFn<T>,
        progress: Option<&ProgressCallback>,
        results: &mut HashMap<String, T>,
    ) -> Result<(), BatchError> {
        loop {
            if self.cancelled.load(Ordering::Acquire) {
                info!("Batch cancelled, no further windows will be submitted");
                return Ok(());
            }

            if self.paused.load(Ordering::Acquire) {
                self.transition(BatchState::Running, BatchState::Paused);
                tokio::time::sleep(self.config.pause_poll_interval()).await;
                continue;
            }
            self.transition(BatchState::Paused, BatchState::Running);

            if self.run.lock().remaining.is_empty() {
                return Ok(());
            }

            if self.config.auto_adjust_workers {
                self.adjust_workers();
            }

            let workers = self.workers.load(Ordering::Acquire);
            let window: Vec<String> = {
                let run = self.run.lock();
                run.remaining
                    .iter()
                    .take(workers * WINDOW_PER_WORKER)
                    .cloned()
                    .collect()
            };

            #[cfg(test)]
            self.take_window_fault()?;

            debug!("Submitting window of {} jobs to {} workers", window.len(), workers);
            self.run_window(window, workers, job_fn, progress, results)
                .await?;

            self.save_checkpoint();
        }
    }

    async fn run_window<T: Send + 'static>(
        &self,
        window: Vec<String>,
        workers: usize,
        job_fn: &JobFn<T>,
        progress: Option<&ProgressCallback>,
        results: &mut HashMap<String, T>,
    ) -> Result<(), BatchError> {
        let semaphore = Arc::new(Semaphore::new(workers));
        let mut tasks: JoinSet<WindowResult<T>> = JoinSet::new();

        for job_id in window {
            let semaphore = Arc::clone(&semaphore);
            let job_fn = Arc::clone(job_fn);
            let policy = self.retry.clone();
            let cancelled = Arc::clone(&self.cancelled);

            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.map_err(|e| {
                    BatchError::WorkerPool(format!("failed to acquire worker permit: {}", e))
                })?;

                // Queued behind the permit when cancel arrived: never started
                if cancelled.load(Ordering::Acquire) {
                    return Ok((job_id, None));
                }

                let id = job_id.clone();
                let outcome = tokio::task::spawn_blocking(move || {
                    perf_trace!("Worker picked up job {}", id);
                    run_job(&job_fn, &id, &policy, &cancelled)
                })
                .await
                .map_err(|e| BatchError::WorkerPool(format!("worker thread failed: {}", e)))?;

                Ok((job_id, Some(outcome)))
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let (job_id, outcome) = match joined {
                Ok(Ok(done)) => done,
                Ok(Err(e)) => return Err(e),
                Err(e) => {
                    return Err(BatchError::WorkerPool(format!("worker task failed: {}", e)))
                }
            };

            if self.cancelled.load(Ordering::Acquire) {
                debug!("Discarding result of {} after cancellation", job_id);
                continue;
            }

            if let Some(outcome) = outcome {
                self.record_completion(job_id, outcome, progress, results);
            }
        }

        Ok(())
    }

    fn record_completion<T>(
        &self,
        job_id: String,
        outcome: JobOutcome<T>,
        progress: Option<&ProgressCallback>,
        results: &mut HashMap<String, T>,
    ) {
        let memory_mb = self.monitor.latest().map(|u| u.memory_mb);

        let (snapshot, event, checkpoint_due) = {
            let mut run = self.run.lock();
            if let Some(pos) = run.remaining.iter().position(|id| *id == job_id) {
                run.remaining.remove(pos);
            }

            let event = match outcome.result {
                Ok(value) => {
                    run.processed.push(job_id.clone());
                    run.stats.processed_count += 1;
                    results.insert(job_id.clone(), value);
                    BatchEvent::JobCompleted {
                        job_id,
                        attempts: outcome.attempts,
                    }
                }
                Err(err) => {
                    warn!("Job {} failed ({}): {}", job_id, err.kind, err);
                    run.failed.push(FailedJob::new(&job_id, &err));
                    run.stats.failed_count += 1;
                    BatchEvent::JobFailed {
                        job_id,
                        error: err.to_string(),
                        kind: err.kind,
                    }
                }
            };

            run.session_completed += 1;
            run.since_checkpoint += 1;
            if let Some(memory_mb) = memory_mb {
                run.stats.memory_usage_mb = memory_mb;
            }
            run.refresh_timing();

            perf_debug!(
                "Batch {}: {}/{} done",
                run.batch_id,
                run.stats.completed(),
                run.stats.total_jobs
            );

            let due = run.since_checkpoint >= self.config.checkpoint_interval_jobs;
            (run.stats.clone(), event, due)
        };

        self.emit(event);

        if let Some(callback) = progress {
            if panic::catch_unwind(AssertUnwindSafe(|| callback(&snapshot))).is_err() {
                error!("Progress callback panicked");
            }
        }

        if checkpoint_due {
            self.save_checkpoint();
        }
    }

    fn adjust_workers(&self) {
        let usage = match self.monitor.sample() {
            Ok(usage) => usage,
            Err(e) => {
                warn!("Resource sample failed, keeping worker count: {}", e);
                return;
            }
        };

        let current = self.workers.load(Ordering::Acquire);
        let next = next_worker_count(
            current,
            self.config.max_workers,
            usage,
            self.config.memory_limit_mb as f64,
        );

        {
            let mut run = self.run.lock();
            run.stats.memory_usage_mb = usage.memory_mb;
            run.stats.current_worker_count = next;
        }

        if next != current {
            self.workers.store(next, Ordering::Release);
            info!(
                "Adjusted workers: {} -> {} (memory={:.0}MB, cpu={:.0}%)",
                current, next, usage.memory_mb, usage.cpu_percent
            );
            self.emit(BatchEvent::WorkersAdjusted {
                from: current,
                to: next,
            });
        }
    }

    fn save_checkpoint(&self) {
        let Some(store) = &self.checkpoint else {
            return;
        };

        let record = {
            let mut run = self.run.lock();
            run.since_checkpoint = 0;
            run.to_record()
        };

        if store.save_record(&record) {
            self.emit(BatchEvent::CheckpointSaved {
                processed: record.processed.len(),
                failed: record.failed.len(),
                remaining: record.remaining.len(),
            });
        }
    }

    fn finish_run<T>(
        &self,
        outcome: Result<(), BatchError>,
        results: HashMap<String, T>,
    ) -> BatchReport<T> {
        let (state, error_message) = {
            let mut run = self.run.lock();
            let state = match &outcome {
                Err(e) => {
                    error!("Batch {} failed: {}", run.batch_id, e);
                    BatchState::Failed
                }
                Ok(()) if run.remaining.is_empty() => BatchState::Completed,
                Ok(()) => BatchState::Cancelled,
            };

            run.state = state;
            run.refresh_timing();
            if state == BatchState::Completed {
                run.stats.estimated_remaining_secs = 0.0;
            }
            if let Some(usage) = self.monitor.latest() {
                run.stats.memory_usage_mb = usage.memory_mb;
            }
            (state, outcome.err().map(|e| e.to_string()))
        };

        match state {
            BatchState::Completed => {
                if let Some(store) = &self.checkpoint {
                    store.clear();
                }
            }
            _ => self.save_checkpoint(),
        }

        let run = self.run.lock();
        info!(
            "Batch {} finished ({:?}): {} processed, {} failed, {} remaining in {:.1}s",
            run.batch_id,
            state,
            run.processed.len(),
            run.failed.len(),
            run.remaining.len(),
            run.stats.elapsed_secs
        );

        self.emit(BatchEvent::Finished {
            batch_id: run.batch_id.clone(),
            state,
            processed: run.processed.len(),
            failed: run.failed.len(),
        });

        BatchReport {
            batch_id: run.batch_id.clone(),
            success: state == BatchState::Completed,
            state,
            processed: run.processed.clone(),
            failed: run.failed.clone(),
            results,
            stats: run.stats.clone(),
            error: error_message,
        }
    }

    fn rejected_report<T>(&self, batch_id: String, error: BatchError) -> BatchReport<T> {
        BatchReport {
            batch_id,
            success: false,
            state: self.state(),
            processed: Vec::new(),
            failed: Vec::new(),
            results: HashMap::new(),
            stats: BatchStats::default(),
            error: Some(error.to_string()),
        }
    }

    /// Make the window after `windows_ok` successful ones fail as if the
    /// worker pool broke
    #[cfg(test)]
    pub(crate) fn fail_window_after(&self, windows_ok: usize) {
        *self.window_fault.lock() = Some(windows_ok);
    }

    #[cfg(test)]
    fn take_window_fault(&self) -> Result<(), BatchError> {
        let mut fault = self.window_fault.lock();
        match *fault {
            Some(0) => {
                *fault = None;
                Err(BatchError::WorkerPool("worker threads unavailable".to_string()))
            }
            Some(left) => {
                *fault = Some(left - 1);
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn transition(&self, from: BatchState, to: BatchState) {
        let mut run = self.run.lock();
        if run.state == from {
            run.state = to;
            debug!("Batch state {:?} -> {:?}", from, to);
        }
    }

    fn emit(&self, event: BatchEvent) {
        // Nobody listening is fine
        let _ = self.event_sender.send(event);
    }

    /// Stop submitting windows. In-flight jobs finish but are not recorded,
    /// so they run again on resume.
    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            info!("Batch processing cancelled");
            self.emit(BatchEvent::Cancelled);
        }
    }

    /// Hold off the next window; running jobs are not interrupted
    pub fn pause(&self) {
        if !self.paused.swap(true, Ordering::AcqRel) {
            self.transition(BatchState::Running, BatchState::Paused);
            info!("Batch processing paused");
            self.emit(BatchEvent::Paused);
        }
    }

    pub fn resume(&self) {
        if self.paused.swap(false, Ordering::AcqRel) {
            self.transition(BatchState::Paused, BatchState::Running);
            info!("Batch processing resumed");
            self.emit(BatchEvent::Resumed);
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn state(&self) -> BatchState {
        self.run.lock().state
    }

    pub fn get_progress(&self) -> BatchProgress {
        let run = self.run.lock();
        let elapsed_secs = match (run.state.is_terminal(), run.session_started) {
            (false, Some(started)) => started.elapsed().as_secs_f64(),
            _ => run.stats.elapsed_secs,
        };

        BatchProgress {
            processed_count: run.stats.processed_count,
            failed_count: run.stats.failed_count,
            remaining_count: run.remaining.len(),
            progress_percent: run.stats.progress_percent(),
            estimated_remaining_secs: run.stats.estimated_remaining_secs,
            current_worker_count: run.stats.current_worker_count,
            memory_usage_mb: run.stats.memory_usage_mb,
            state: run.state,
            elapsed_secs,
        }
    }
}
