use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::{anyhow, Result};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::probe::{ResourceUsage, SysinfoProbe, UsageProbe};

/// Fraction of the memory limit above which usage counts as a warning
pub const WARNING_RATIO: f64 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryLevel {
    Normal,
    Warning,
    Critical,
}

type MemoryCallback = Arc<dyn Fn(f64) + Send + Sync>;
type PressureHook = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Readings {
    latest: Option<ResourceUsage>,
    peak_mb: f64,
}

/// Samples process memory and CPU, tracks the peak and reacts to pressure
pub struct ResourceMonitor {
    probe: Box<dyn UsageProbe>,
    limit_mb: f64,
    readings: Mutex<Readings>,
    callbacks: Mutex<Vec<MemoryCallback>>,
    pressure_hooks: Mutex<Vec<PressureHook>>,
    background: Mutex<Option<CancellationToken>>,
}

impl ResourceMonitor {
    pub fn new(probe: Box<dyn UsageProbe>, limit_mb: f64) -> Self {
        info!("Initializing resource monitor (limit={:.0}MB)", limit_mb);
        Self {
            probe,
            limit_mb,
            readings: Mutex::new(Readings::default()),
            callbacks: Mutex::new(Vec::new()),
            pressure_hooks: Mutex::new(Vec::new()),
            background: Mutex::new(None),
        }
    }

    /// Monitor backed by live sysinfo readings of this process
    pub fn system(limit_mb: f64) -> Result<Self> {
        Ok(Self::new(Box::new(SysinfoProbe::new()?), limit_mb))
    }

    pub fn limit_mb(&self) -> f64 {
        self.limit_mb
    }

    /// Take a reading now and fold it into latest/peak
    pub fn sample(&self) -> Result<ResourceUsage> {
        let usage = self.probe.probe()?;
        let mut readings = self.readings.lock();
        readings.latest = Some(usage);
        if usage.memory_mb > readings.peak_mb {
            readings.peak_mb = usage.memory_mb;
        }
        Ok(usage)
    }

    pub fn latest(&self) -> Option<ResourceUsage> {
        self.readings.lock().latest
    }

    pub fn peak_mb(&self) -> f64 {
        self.readings.lock().peak_mb
    }

    pub fn memory_level(&self, memory_mb: f64) -> MemoryLevel {
        if memory_mb > self.limit_mb {
            MemoryLevel::Critical
        } else if memory_mb > self.limit_mb * WARNING_RATIO {
            MemoryLevel::Warning
        } else {
            MemoryLevel::Normal
        }
    }

    /// Whether `required_mb` more would still fit under the limit.
    /// Falls back to the last reading when a fresh one fails.
    pub fn has_headroom(&self, required_mb: f64) -> bool {
        let current = match self.sample() {
            Ok(usage) => usage.memory_mb,
            Err(e) => {
                warn!("Memory sample failed, using last reading: {}", e);
                self.latest().map(|usage| usage.memory_mb).unwrap_or(0.0)
            }
        };
        current + required_mb <= self.limit_mb
    }

    /// Called with every background memory reading
    pub fn register_callback<F>(&self, callback: F)
    where
        F: Fn(f64) + Send + Sync + 'static,
    {
        self.callbacks.lock().push(Arc::new(callback));
    }

    /// Called whenever a background reading exceeds the limit
    pub fn register_pressure_hook<F>(&self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.pressure_hooks.lock().push(Arc::new(hook));
    }

    /// One background iteration: sample, notify, relieve pressure if over the limit
    pub fn poll_once(&self) -> Option<ResourceUsage> {
        let usage = match self.sample() {
            Ok(usage) => usage,
            Err(e) => {
                warn!("Resource sample failed: {}", e);
                return None;
            }
        };

        // Snapshot so callbacks may register further callbacks
        let callbacks: Vec<MemoryCallback> = self.callbacks.lock().clone();
        for callback in callbacks {
            if panic::catch_unwind(AssertUnwindSafe(|| callback(usage.memory_mb))).is_err() {
                error!("Memory callback panicked");
            }
        }

        match self.memory_level(usage.memory_mb) {
            MemoryLevel::Critical => {
                warn!(
                    "Memory usage {:.1}MB exceeds limit {:.0}MB, releasing resources",
                    usage.memory_mb, self.limit_mb
                );
                let hooks: Vec<PressureHook> = self.pressure_hooks.lock().clone();
                for hook in hooks {
                    if panic::catch_unwind(AssertUnwindSafe(|| hook())).is_err() {
                        error!("Memory pressure hook panicked");
                    }
                }
            }
            MemoryLevel::Warning => debug!(
                "Memory usage {:.1}MB above {:.0}% of limit",
                usage.memory_mb,
                WARNING_RATIO * 100.0
            ),
            MemoryLevel::Normal => {}
        }

        Some(usage)
    }

    /// Start periodic sampling on the current Tokio runtime.
    /// A second call while already running does nothing.
    pub fn start_background(self: &Arc<Self>, interval: Duration) -> Result<()> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| anyhow!("resource monitor needs a Tokio runtime: {}", e))?;
        if interval.is_zero() {
            return Err(anyhow!("monitor interval must be greater than 0"));
        }

        let mut background = self.background.lock();
        if background.is_some() {
            debug!("Resource monitor already running");
            return Ok(());
        }

        let token = CancellationToken::new();
        let task_token = token.clone();
        let monitor: Weak<Self> = Arc::downgrade(self);

        handle.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(monitor) = monitor.upgrade() else {
                            break;
                        };
                        monitor.poll_once();
                    }
                }
            }
            debug!("Resource monitor task exited");
        });

        *background = Some(token);
        info!("Resource monitor started (interval={}ms)", interval.as_millis());
        Ok(())
    }

    pub fn stop(&self) {
        if let Some(token) = self.background.lock().take() {
            token.cancel();
            info!("Resource monitor stopped (peak={:.1}MB)", self.peak_mb());
        }
    }

    pub fn is_running(&self) -> bool {
        self.background.lock().is_some()
    }
}

impl Drop for ResourceMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::StaticProbe;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn monitor_with(memory_mb: f64, limit_mb: f64) -> (ResourceMonitor, Arc<StaticProbe>) {
        let probe = Arc::new(StaticProbe::new(memory_mb, 10.0));
        let monitor = ResourceMonitor::new(Box::new(Arc::clone(&probe)), limit_mb);
        (monitor, probe)
    }

    #[test]
    fn test_sample_tracks_latest_and_peak() {
        let (monitor, probe) = monitor_with(300.0, 1000.0);
        monitor.sample().unwrap();
        probe.set(200.0, 5.0);
        monitor.sample().unwrap();

        assert_eq!(monitor.latest().unwrap().memory_mb, 200.0);
        assert_eq!(monitor.peak_mb(), 300.0);
    }

    #[test]
    fn test_has_headroom() {
        let (monitor, _probe) = monitor_with(600.0, 1000.0);
        assert!(monitor.has_headroom(400.0));
        assert!(!monitor.has_headroom(401.0));
    }

    #[test]
    fn test_memory_levels() {
        let (monitor, _probe) = monitor_with(0.0, 1000.0);
        assert_eq!(monitor.memory_level(500.0), MemoryLevel::Normal);
        assert_eq!(monitor.memory_level(850.0), MemoryLevel::Warning);
        assert_eq!(monitor.memory_level(1001.0), MemoryLevel::Critical);
    }

    #[test]
    fn test_poll_notifies_callbacks_and_relieves_pressure() {
        let (monitor, probe) = monitor_with(100.0, 1000.0);
        let readings = Arc::new(Mutex::new(Vec::new()));
        let relieved = Arc::new(AtomicUsize::new(0));
        {
            let readings = Arc::clone(&readings);
            monitor.register_callback(move |mb| readings.lock().push(mb));
        }
        monitor.register_callback(|_| panic!("misbehaving listener"));
        {
            let relieved = Arc::clone(&relieved);
            monitor.register_pressure_hook(move || {
                relieved.fetch_add(1, Ordering::SeqCst);
            });
        }

        monitor.poll_once();
        assert_eq!(relieved.load(Ordering::SeqCst), 0);

        probe.set(1500.0, 10.0);
        monitor.poll_once();
        assert_eq!(relieved.load(Ordering::SeqCst), 1);
        assert_eq!(*readings.lock(), vec![100.0, 1500.0]);
    }

    #[test]
    fn test_start_without_runtime_fails() {
        let (monitor, _probe) = monitor_with(100.0, 1000.0);
        let monitor = Arc::new(monitor);
        assert!(monitor.start_background(Duration::from_millis(10)).is_err());
        assert!(!monitor.is_running());
    }

    #[tokio::test]
    async fn test_background_sampling_until_stopped() {
        let (monitor, _probe) = monitor_with(100.0, 1000.0);
        let monitor = Arc::new(monitor);
        let calls = Arc::new(AtomicUsize::new(0));
        {
            let calls = Arc::clone(&calls);
            monitor.register_callback(move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
            });
        }

        monitor.start_background(Duration::from_millis(10)).unwrap();
        monitor.start_background(Duration::from_millis(10)).unwrap();
        assert!(monitor.is_running());

        tokio::time::sleep(Duration::from_millis(100)).await;
        monitor.stop();
        monitor.stop();
        assert!(!monitor.is_running());

        let seen = calls.load(Ordering::SeqCst);
        assert!(seen >= 2, "expected several samples, got {}", seen);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(calls.load(Ordering::SeqCst) <= seen + 1);
    }
}
