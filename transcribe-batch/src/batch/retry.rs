use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use log::{error, warn};

use super::stats::JobFn;
use crate::error::JobError;

/// Granularity of cancellation checks while backing off
const BACKOFF_SLICE: Duration = Duration::from_millis(50);

/// Exponential backoff for transient job failures
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// `min(base × 2^attempt, max)`, attempt counted from 0
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

pub(crate) struct JobOutcome<T> {
    pub result: Result<T, JobError>,
    pub attempts: u32,
}

/// Run one job on the current (blocking) thread, retrying transient failures.
/// Panics never escape; they become permanent failures.
pub(crate) fn run_job<T>(
    job_fn: &JobFn<T>,
    job_id: &str,
    policy: &RetryPolicy,
    cancelled: &AtomicBool,
) -> JobOutcome<T> {
    let mut attempt: u32 = 0;
    loop {
        let result = call_guarded(job_fn, job_id);
        let err = match result {
            Err(err) if err.is_retryable() && attempt < policy.max_retries => err,
            result => {
                return JobOutcome {
                    result,
                    attempts: attempt + 1,
                }
            }
        };

        if cancelled.load(Ordering::Acquire) {
            return JobOutcome {
                result: Err(err),
                attempts: attempt + 1,
            };
        }

        let delay = policy.delay_for(attempt);
        warn!(
            "Job {} failed ({}), retrying in {:.1}s (attempt {}/{})",
            job_id,
            err,
            delay.as_secs_f64(),
            attempt + 1,
            policy.max_retries
        );

        if !sleep_unless_cancelled(delay, cancelled) {
            return JobOutcome {
                result: Err(err),
                attempts: attempt + 1,
            };
        }
        attempt += 1;
    }
}

fn call_guarded<T>(job_fn: &JobFn<T>, job_id: &str) -> Result<T, JobError> {
    match panic::catch_unwind(AssertUnwindSafe(|| job_fn(job_id))) {
        Ok(result) => result,
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!("Job {} panicked: {}", job_id, message);
            Err(JobError::permanent(format!("job panicked: {}", message)))
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// False when cancellation cut the sleep short
fn sleep_unless_cancelled(total: Duration, cancelled: &AtomicBool) -> bool {
    let deadline = Instant::now() + total;
    loop {
        if cancelled.load(Ordering::Acquire) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        std::thread::sleep(BACKOFF_SLICE.min(deadline - now));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }

    #[test]
    fn test_backoff_doubles_up_to_ceiling() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(5), Duration::from_secs(32));
        assert_eq!(policy.delay_for(6), Duration::from_secs(60));
        assert_eq!(policy.delay_for(40), Duration::from_secs(60));
    }

    #[test]
    fn test_transient_failure_retried_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let job_fn: JobFn<u32> = {
            let calls = Arc::clone(&calls);
            Arc::new(move |_| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(JobError::transient("device busy"))
                } else {
                    Ok(n)
                }
            })
        };

        let outcome = run_job(&job_fn, "a.wav", &fast_policy(2), &AtomicBool::new(false));
        assert_eq!(outcome.result.unwrap(), 2);
        assert_eq!(outcome.attempts, 3);
    }

    #[test]
    fn test_retries_exhausted_returns_last_error() {
        let job_fn: JobFn<()> = Arc::new(|_| Err(JobError::transient("device busy")));
        let outcome = run_job(&job_fn, "a.wav", &fast_policy(1), &AtomicBool::new(false));
        assert_eq!(outcome.attempts, 2);
        assert_eq!(outcome.result.unwrap_err().detail, "device busy");
    }

    #[test]
    fn test_permanent_failure_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let job_fn: JobFn<()> = {
            let calls = Arc::clone(&calls);
            Arc::new(move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(JobError::permanent("unsupported format"))
            })
        };

        let outcome = run_job(&job_fn, "a.txt", &fast_policy(3), &AtomicBool::new(false));
        assert!(outcome.result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cancellation_stops_retries() {
        let job_fn: JobFn<()> = Arc::new(|_| Err(JobError::transient("device busy")));
        let outcome = run_job(&job_fn, "a.wav", &fast_policy(5), &AtomicBool::new(true));
        assert_eq!(outcome.attempts, 1);
    }

    #[test]
    fn test_panic_becomes_permanent_failure() {
        let job_fn: JobFn<()> = Arc::new(|id| panic!("decoder exploded on {}", id));
        let outcome = run_job(&job_fn, "a.wav", &fast_policy(2), &AtomicBool::new(false));
        let err = outcome.result.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Permanent);
        assert!(err.detail.contains("decoder exploded on a.wav"));
        assert_eq!(outcome.attempts, 1);
    }
}
