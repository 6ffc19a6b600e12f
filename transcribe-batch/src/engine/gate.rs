use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, ThreadId};
use std::time::Instant;

use log::{info, warn};
use parking_lot::{Mutex, MutexGuard};

use super::model::InferenceModel;
use crate::error::{GateError, JobError};
use crate::pool::Closeable;

type ModelLoader<M> = Box<dyn Fn() -> anyhow::Result<M> + Send + Sync>;

/// Serialises every use of one lazily loaded model.
///
/// `with_exclusive` calls never overlap, no matter how many workers share the
/// gate. The closure gets `&mut M` and must not call back into the same gate:
/// the lock is not reentrant, so a nested `with_exclusive`, `ensure_loaded` or
/// `unload` on the holding thread fails with `GateError::Reentrant`.
///
/// Once closed (by the pool evicting it) the gate never reloads; dropping it
/// unloads whatever model is still resident.
pub struct SingleFlightGate<M: InferenceModel> {
    label: String,
    slot: Mutex<Option<M>>,
    holder: Mutex<Option<ThreadId>>, // Thread inside the exclusive section
    loader: ModelLoader<M>,
    load_count: AtomicUsize,
    closed: AtomicBool,
}

/// Clears the holder mark when the exclusive section ends, panics included
struct HolderMark<'a>(&'a Mutex<Option<ThreadId>>);

impl Drop for HolderMark<'_> {
    fn drop(&mut self) {
        *self.0.lock() = None;
    }
}

impl<M: InferenceModel> SingleFlightGate<M> {
    pub fn new<F>(label: impl Into<String>, loader: F) -> Self
    where
        F: Fn() -> anyhow::Result<M> + Send + Sync + 'static,
    {
        Self {
            label: label.into(),
            slot: Mutex::new(None),
            holder: Mutex::new(None),
            loader: Box::new(loader),
            load_count: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    fn enter(&self) -> Result<(MutexGuard<'_, Option<M>>, HolderMark<'_>), GateError> {
        let me = thread::current().id();
        if *self.holder.lock() == Some(me) {
            warn!("Gate {} re-entered on the holding thread", self.label);
            return Err(GateError::Reentrant(self.label.clone()));
        }

        let slot = self.slot.lock();
        *self.holder.lock() = Some(me);
        Ok((slot, HolderMark(&self.holder)))
    }

    /// Run `f` with exclusive access, loading the model first if needed
    pub fn with_exclusive<T, F>(&self, f: F) -> Result<T, GateError>
    where
        F: FnOnce(&mut M) -> T,
    {
        let (mut slot, _mark) = self.enter()?;
        let entered = Instant::now();

        if let Some(model) = slot.as_mut() {
            let out = f(model);
            perf_debug!(
                "Gate {} held for {:.1}ms",
                self.label,
                entered.elapsed().as_secs_f64() * 1000.0
            );
            return Ok(out);
        }

        if self.closed.load(Ordering::Acquire) {
            return Err(GateError::Closed(self.label.clone()));
        }
        let model = slot.insert(self.load()?);
        Ok(f(model))
    }

    /// Inference through the gate; a failed load is a resource failure
    pub fn infer(&self, input: M::Input) -> Result<M::Output, JobError> {
        self.with_exclusive(|model| model.infer(input))?
    }

    /// Load now instead of on first use
    pub fn ensure_loaded(&self) -> Result<(), GateError> {
        self.with_exclusive(|_| ())
    }

    /// Blocks while an inference is running
    pub fn is_loaded(&self) -> bool {
        self.slot.lock().is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of successful loads over the gate's lifetime
    pub fn load_count(&self) -> usize {
        self.load_count.load(Ordering::Acquire)
    }

    /// Tear the model down; unless the gate is closed, the next
    /// `with_exclusive` reloads it
    pub fn unload(&self) -> anyhow::Result<()> {
        let (mut slot, _mark) = self.enter()?;
        match slot.take() {
            Some(mut model) => {
                info!("Unloading model: {}", self.label);
                model.unload()
            }
            None => Ok(()),
        }
    }

    fn load(&self) -> Result<M, GateError> {
        info!("Loading model: {}", self.label);
        let started = Instant::now();
        let model = (self.loader)().map_err(|e| {
            warn!("Model {} failed to load: {}", self.label, e);
            GateError::LoadFailed(e)
        })?;
        self.load_count.fetch_add(1, Ordering::AcqRel);
        info!(
            "Model loaded: {} ({:.2}s)",
            self.label,
            started.elapsed().as_secs_f64()
        );
        Ok(model)
    }
}

impl<M: InferenceModel> Closeable for SingleFlightGate<M> {
    fn close(&self) -> anyhow::Result<()> {
        self.closed.store(true, Ordering::Release);
        self.unload()
    }

    fn approx_memory_mb(&self) -> Option<f64> {
        // Never wait on a running inference just to report size
        self.slot
            .try_lock()
            .and_then(|slot| slot.as_ref().and_then(|model| model.approx_memory_mb()))
    }
}

impl<M: InferenceModel> Drop for SingleFlightGate<M> {
    fn drop(&mut self) {
        if let Some(mut model) = self.slot.get_mut().take() {
            info!("Unloading model on drop: {}", self.label);
            if let Err(e) = model.unload() {
                warn!("Model {} failed to unload: {}", self.label, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::{Arc, Barrier};
    use std::time::Duration;

    struct SlowModel {
        busy: Arc<AtomicBool>,
        overlaps: Arc<AtomicUsize>,
        unloads: Arc<AtomicUsize>,
    }

    impl InferenceModel for SlowModel {
        type Input = Duration;
        type Output = ();

        fn infer(&mut self, work: Duration) -> Result<(), JobError> {
            if self.busy.swap(true, Ordering::SeqCst) {
                self.overlaps.fetch_add(1, Ordering::SeqCst);
            }
            std::thread::sleep(work);
            self.busy.store(false, Ordering::SeqCst);
            Ok(())
        }

        fn unload(&mut self) -> anyhow::Result<()> {
            self.unloads.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Probes {
        overlaps: Arc<AtomicUsize>,
        unloads: Arc<AtomicUsize>,
    }

    fn slow_gate() -> (SingleFlightGate<SlowModel>, Probes) {
        let busy = Arc::new(AtomicBool::new(false));
        let overlaps = Arc::new(AtomicUsize::new(0));
        let unloads = Arc::new(AtomicUsize::new(0));
        let probes = Probes {
            overlaps: Arc::clone(&overlaps),
            unloads: Arc::clone(&unloads),
        };
        let gate = SingleFlightGate::new("slow", move || {
            std::thread::sleep(Duration::from_millis(20));
            Ok(SlowModel {
                busy: Arc::clone(&busy),
                overlaps: Arc::clone(&overlaps),
                unloads: Arc::clone(&unloads),
            })
        });
        (gate, probes)
    }

    #[test]
    fn test_concurrent_calls_never_overlap_and_load_once() {
        let (gate, probes) = slow_gate();
        let gate = Arc::new(gate);
        let threads = 4;
        let barrier = Arc::new(Barrier::new(threads));

        let started = Instant::now();
        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let gate = Arc::clone(&gate);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    gate.infer(Duration::from_millis(50)).unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert!(started.elapsed() >= Duration::from_millis(50 * threads as u64));
        assert_eq!(probes.overlaps.load(Ordering::SeqCst), 0);
        assert_eq!(gate.load_count(), 1);
    }

    #[test]
    fn test_unload_without_load_is_safe() {
        let (gate, probes) = slow_gate();
        assert!(gate.unload().is_ok());
        assert!(!gate.is_loaded());
        assert_eq!(probes.unloads.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unload_then_use_reloads() {
        let (gate, probes) = slow_gate();
        gate.ensure_loaded().unwrap();
        assert!(gate.is_loaded());

        gate.unload().unwrap();
        assert_eq!(probes.unloads.load(Ordering::SeqCst), 1);

        gate.infer(Duration::ZERO).unwrap();
        assert_eq!(gate.load_count(), 2);
    }

    #[test]
    fn test_failed_load_is_reported_and_retried_next_call() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let gate = {
            let attempts = Arc::clone(&attempts);
            SingleFlightGate::new("flaky", move || {
                if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                    anyhow::bail!("accelerator busy");
                }
                Ok(SlowModel {
                    busy: Arc::new(AtomicBool::new(false)),
                    overlaps: Arc::new(AtomicUsize::new(0)),
                    unloads: Arc::new(AtomicUsize::new(0)),
                })
            })
        };

        let err = gate.infer(Duration::ZERO).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Resource);
        assert!(err.detail.contains("accelerator busy"));
        assert_eq!(gate.load_count(), 0);

        assert!(gate.infer(Duration::ZERO).is_ok());
        assert_eq!(gate.load_count(), 1);
    }

    #[test]
    fn test_close_unloads_model() {
        let (gate, probes) = slow_gate();
        gate.ensure_loaded().unwrap();
        Closeable::close(&gate).unwrap();
        assert!(!gate.is_loaded());
        assert!(gate.is_closed());
        assert_eq!(probes.unloads.load(Ordering::SeqCst), 1);

        assert!(matches!(gate.ensure_loaded(), Err(GateError::Closed(_))));
        assert_eq!(gate.load_count(), 1);
    }

    #[test]
    fn test_drop_unloads_resident_model() {
        let (gate, probes) = slow_gate();
        gate.ensure_loaded().unwrap();
        drop(gate);
        assert_eq!(probes.unloads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_nested_call_fails_instead_of_deadlocking() {
        let (gate, _probes) = slow_gate();

        let nested = gate.with_exclusive(|_| gate.ensure_loaded()).unwrap();
        assert!(matches!(nested, Err(GateError::Reentrant(_))));

        let nested_unload = gate.with_exclusive(|_| gate.unload().is_err()).unwrap();
        assert!(nested_unload);
        assert!(gate.is_loaded());

        // The gate is still usable once the outer section ends
        gate.infer(Duration::ZERO).unwrap();
        assert_eq!(gate.load_count(), 1);
    }

    #[test]
    fn test_gate_evicted_under_a_lease_is_torn_down_once() {
        use crate::pool::{PoolConfig, ResourcePool};

        let loads = Arc::new(AtomicUsize::new(0));
        let unloads = Arc::new(AtomicUsize::new(0));
        let gate_loader = |loads: Arc<AtomicUsize>, unloads: Arc<AtomicUsize>| {
            move |key: &str| -> anyhow::Result<SingleFlightGate<SlowModel>> {
                let loads = Arc::clone(&loads);
                let unloads = Arc::clone(&unloads);
                Ok(SingleFlightGate::new(key, move || {
                    loads.fetch_add(1, Ordering::SeqCst);
                    Ok(SlowModel {
                        busy: Arc::new(AtomicBool::new(false)),
                        overlaps: Arc::new(AtomicUsize::new(0)),
                        unloads: Arc::clone(&unloads),
                    })
                }))
            }
        };

        let pool = ResourcePool::new(PoolConfig {
            max_entries: 1,
            auto_unload: false,
            ..PoolConfig::default()
        })
        .unwrap();

        let lease_a = pool
            .checkout("a", gate_loader(Arc::clone(&loads), Arc::clone(&unloads)))
            .unwrap();
        lease_a.infer(Duration::ZERO).unwrap();

        let lease_b = pool
            .checkout("b", gate_loader(Arc::clone(&loads), Arc::clone(&unloads)))
            .unwrap();
        assert!(!pool.contains("a"));

        let err = lease_a.infer(Duration::ZERO).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Resource);

        lease_b.infer(Duration::ZERO).unwrap();
        drop(lease_a);
        drop(lease_b);
        pool.shutdown();

        assert_eq!(loads.load(Ordering::SeqCst), 2);
        assert_eq!(unloads.load(Ordering::SeqCst), 2);
    }
}
