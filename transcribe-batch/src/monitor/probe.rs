use std::time::Instant;

use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System, MINIMUM_CPU_UPDATE_INTERVAL};

use crate::utils::bytes_to_mb;

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub memory_mb: f64,   // Resident set size of this process
    pub cpu_percent: f32, // Global CPU usage since the previous probe
}

/// Source of point-in-time usage readings
pub trait UsageProbe: Send + Sync {
    fn probe(&self) -> Result<ResourceUsage>;
}

impl<P: UsageProbe + ?Sized> UsageProbe for std::sync::Arc<P> {
    fn probe(&self) -> Result<ResourceUsage> {
        (**self).probe()
    }
}

struct SysinfoState {
    system: System,
    cpu_percent: f32,
    cpu_refreshed: Instant,
}

/// Reads the current process RSS and global CPU usage through sysinfo.
///
/// CPU usage is a delta between two refreshes; deltas shorter than
/// `MINIMUM_CPU_UPDATE_INTERVAL` are noise, so back-to-back probes reuse the
/// last CPU figure while memory is always read fresh.
pub struct SysinfoProbe {
    state: Mutex<SysinfoState>,
    pid: Pid,
}

impl SysinfoProbe {
    pub fn new() -> Result<Self> {
        let pid = sysinfo::get_current_pid().map_err(|e| anyhow!("cannot resolve own pid: {}", e))?;
        let mut system = System::new();
        // First CPU refresh only establishes the baseline for the next delta
        system.refresh_cpu_usage();

        Ok(Self {
            state: Mutex::new(SysinfoState {
                system,
                cpu_percent: 0.0,
                cpu_refreshed: Instant::now(),
            }),
            pid,
        })
    }
}

impl UsageProbe for SysinfoProbe {
    fn probe(&self) -> Result<ResourceUsage> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        if state.cpu_refreshed.elapsed() >= MINIMUM_CPU_UPDATE_INTERVAL {
            state.system.refresh_cpu_usage();
            state.cpu_percent = state.system.global_cpu_usage();
            state.cpu_refreshed = Instant::now();
        }

        state.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[self.pid]),
            true,
            ProcessRefreshKind::new().with_memory(),
        );

        let process = state
            .system
            .process(self.pid)
            .ok_or_else(|| anyhow!("process {} not visible to sysinfo", self.pid))?;

        Ok(ResourceUsage {
            memory_mb: bytes_to_mb(process.memory()),
            cpu_percent: state.cpu_percent,
        })
    }
}

/// Reports whatever reading it was last given.
///
/// Stands in for live metrics where they would make decisions
/// nondeterministic, e.g. when worker scaling must stay fixed.
#[derive(Default)]
pub struct StaticProbe {
    usage: Mutex<ResourceUsage>,
}

impl StaticProbe {
    pub fn new(memory_mb: f64, cpu_percent: f32) -> Self {
        Self {
            usage: Mutex::new(ResourceUsage {
                memory_mb,
                cpu_percent,
            }),
        }
    }

    pub fn set(&self, memory_mb: f64, cpu_percent: f32) {
        *self.usage.lock() = ResourceUsage {
            memory_mb,
            cpu_percent,
        };
    }
}

impl UsageProbe for StaticProbe {
    fn probe(&self) -> Result<ResourceUsage> {
        Ok(*self.usage.lock())
    }
}
