use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, RecvTimeoutError, Sender};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::lease::PoolLease;
use crate::error::{ConfigError, PoolError};

/// Cleanup capability every pooled resource provides.
///
/// `close` is called exactly once, when the entry leaves the pool. Callers
/// holding an `Arc` from an earlier `get` keep the value alive, so `close`
/// must leave the resource in a state where dropping it is still safe.
pub trait Closeable: Send + Sync {
    fn close(&self) -> anyhow::Result<()>;

    /// Rough resident size, if the resource can tell
    fn approx_memory_mb(&self) -> Option<f64> {
        None
    }
}

pub type Loader<R> = Arc<dyn Fn(&str) -> anyhow::Result<R> + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    pub max_entries: usize,
    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
    pub auto_unload: bool, // Run the idle sweep thread
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_entries: 2,
            idle_timeout: Duration::from_secs(300), // 5 minutes
            sweep_interval: Duration::from_secs(60),
            auto_unload: true,
        }
    }
}

struct ResourceEntry<R> {
    resource: Arc<R>,
    loaded_at: Instant,
    load_time: Duration,
    last_used: Instant,
    access_count: u64,
    active: usize, // Outstanding checkouts
    approx_memory_mb: Option<f64>,
    seq: u64, // Insertion order; also tells a reloaded key from its predecessor
}

struct PoolState<R> {
    entries: HashMap<String, ResourceEntry<R>>,
    next_seq: u64,
    total_loads: u64,
    cache_hits: u64,
    cache_misses: u64,
    evictions: u64,
}

impl<R: Closeable> PoolState<R> {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            next_seq: 0,
            total_loads: 0,
            cache_hits: 0,
            cache_misses: 0,
            evictions: 0,
        }
    }

    fn lru_key(&self) -> Option<String> {
        self.entries
            .iter()
            .min_by_key(|(_, entry)| (entry.last_used, entry.seq))
            .map(|(key, _)| key.clone())
    }

    fn evict(&mut self, key: &str, reason: &str) -> bool {
        let Some(entry) = self.entries.remove(key) else {
            return false;
        };
        self.evictions += 1;
        close_quietly(key, entry.resource.as_ref());
        info!(
            "Evicted {} resource: {} (idle_time={:.1}s, access_count={})",
            reason,
            key,
            entry.last_used.elapsed().as_secs_f64(),
            entry.access_count
        );
        true
    }

    fn evict_where<P>(&mut self, reason: &str, predicate: P) -> usize
    where
        P: Fn(&ResourceEntry<R>) -> bool,
    {
        let keys: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| predicate(entry))
            .map(|(key, _)| key.clone())
            .collect();

        let mut evicted = 0;
        for key in &keys {
            if self.evict(key, reason) {
                evicted += 1;
            }
        }
        evicted
    }

    fn evict_idle(&mut self, idle_timeout: Duration) -> usize {
        let now = Instant::now();
        self.evict_where("idle", |entry| {
            entry.active == 0 && now.saturating_duration_since(entry.last_used) > idle_timeout
        })
    }
}

fn close_quietly<R: Closeable>(key: &str, resource: &R) {
    match panic::catch_unwind(AssertUnwindSafe(|| resource.close())) {
        Ok(Ok(())) => debug!("Closed resource {}", key),
        Ok(Err(e)) => error!("Error during cleanup of {}: {}", key, e),
        Err(_) => error!("Cleanup of {} panicked", key),
    }
}

struct Sweeper {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

/// Bounded LRU cache of loaded resources with idle eviction.
///
/// All state lives behind one pool-wide mutex, and loaders run while holding
/// it: concurrent misses on different keys load one after another. That keeps
/// the entry bound trivially correct at the cost of load throughput.
pub struct ResourcePool<R: Closeable + 'static> {
    state: Arc<Mutex<PoolState<R>>>,
    config: PoolConfig,
    default_loader: Option<Loader<R>>,
    shut_down: AtomicBool,
    sweeper: Mutex<Option<Sweeper>>,
}

impl<R: Closeable + 'static> ResourcePool<R> {
    pub fn new(config: PoolConfig) -> Result<Self, ConfigError> {
        Self::build(config, None)
    }

    /// Pool with a loader used by `get_default`
    pub fn with_loader<F>(config: PoolConfig, loader: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> anyhow::Result<R> + Send + Sync + 'static,
    {
        Self::build(config, Some(Arc::new(loader)))
    }

    fn build(config: PoolConfig, default_loader: Option<Loader<R>>) -> Result<Self, ConfigError> {
        if config.max_entries == 0 {
            return Err(ConfigError::invalid("max_entries", "must be at least 1"));
        }
        if config.auto_unload && config.sweep_interval.is_zero() {
            return Err(ConfigError::invalid("sweep_interval", "must be greater than 0"));
        }

        let pool = Self {
            state: Arc::new(Mutex::new(PoolState::new())),
            config,
            default_loader,
            shut_down: AtomicBool::new(false),
            sweeper: Mutex::new(None),
        };

        if pool.config.auto_unload {
            pool.start_sweeper();
        }

        info!(
            "ResourcePool initialized: max_entries={}, auto_unload={}, idle_timeout={}s",
            pool.config.max_entries,
            pool.config.auto_unload,
            pool.config.idle_timeout.as_secs()
        );
        Ok(pool)
    }

    fn start_sweeper(&self) {
        let (stop_tx, stop_rx) = channel::bounded::<()>(1);
        let state: Weak<Mutex<PoolState<R>>> = Arc::downgrade(&self.state);
        let interval = self.config.sweep_interval;
        let idle_timeout = self.config.idle_timeout;

        let spawned = std::thread::Builder::new()
            .name("resource-pool-sweeper".to_string())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        let Some(state) = state.upgrade() else {
                            break;
                        };
                        let evicted = state.lock().evict_idle(idle_timeout);
                        if evicted > 0 {
                            info!("Idle sweep unloaded {} resource(s)", evicted);
                        }
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            });

        match spawned {
            Ok(handle) => {
                *self.sweeper.lock() = Some(Sweeper {
                    stop: stop_tx,
                    handle,
                });
                debug!("Idle sweep thread started");
            }
            Err(e) => warn!("Idle sweep disabled, failed to spawn thread: {}", e),
        }
    }

    fn stop_sweeper(&self) {
        let Some(sweeper) = self.sweeper.lock().take() else {
            return;
        };
        let _ = sweeper.stop.send(());
        if sweeper.handle.join().is_err() {
            error!("Idle sweep thread panicked");
        }
        debug!("Idle sweep thread stopped");
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Return the cached resource for `key`, loading it on a miss.
    ///
    /// Every successful call counts as one checkout; pair it with `release`
    /// (or use `checkout`, which does so on drop).
    pub fn get<F>(&self, key: &str, loader: F) -> Result<Arc<R>, PoolError>
    where
        F: FnOnce(&str) -> anyhow::Result<R>,
    {
        self.acquire(key, loader).map(|(resource, _)| resource)
    }

    /// `get` plus the generation of the entry that served it
    fn acquire<F>(&self, key: &str, loader: F) -> Result<(Arc<R>, u64), PoolError>
    where
        F: FnOnce(&str) -> anyhow::Result<R>,
    {
        let mut guard = self.state.lock();
        if self.shut_down.load(Ordering::Acquire) {
            return Err(PoolError::ShutDown);
        }
        let state = &mut *guard;

        if let Some(entry) = state.entries.get_mut(key) {
            entry.last_used = Instant::now();
            entry.access_count += 1;
            entry.active += 1;
            state.cache_hits += 1;
            info!(
                "Resource cache HIT: {} (access_count={})",
                key, entry.access_count
            );
            return Ok((Arc::clone(&entry.resource), entry.seq));
        }

        state.cache_misses += 1;
        info!("Resource cache MISS: {}", key);

        if state.entries.len() >= self.config.max_entries {
            if let Some(lru) = state.lru_key() {
                state.evict(&lru, "LRU");
            }
        }

        info!("Loading resource: {}", key);
        let started = Instant::now();
        let resource = loader(key).map_err(|source| {
            error!("Failed to load resource {}: {}", key, source);
            PoolError::LoadFailed {
                key: key.to_string(),
                source,
            }
        })?;
        let load_time = started.elapsed();

        let now = Instant::now();
        let approx_memory_mb = resource.approx_memory_mb();
        let resource = Arc::new(resource);
        let seq = state.next_seq;
        state.next_seq += 1;
        state.total_loads += 1;
        state.entries.insert(
            key.to_string(),
            ResourceEntry {
                resource: Arc::clone(&resource),
                loaded_at: now,
                load_time,
                last_used: now,
                access_count: 1,
                active: 1,
                approx_memory_mb,
                seq,
            },
        );

        info!(
            "Resource loaded: {} (load_time={:.2}s, pool_size={})",
            key,
            load_time.as_secs_f64(),
            state.entries.len()
        );
        Ok((resource, seq))
    }

    /// `get` using the loader supplied at construction
    pub fn get_default(&self, key: &str) -> Result<Arc<R>, PoolError> {
        let loader = self
            .default_loader
            .clone()
            .ok_or_else(|| PoolError::NoLoader(key.to_string()))?;
        self.get(key, |k| loader(k))
    }

    /// `get` wrapped in a guard that releases the resource when dropped
    pub fn checkout<F>(&self, key: &str, loader: F) -> Result<PoolLease<'_, R>, PoolError>
    where
        F: FnOnce(&str) -> anyhow::Result<R>,
    {
        let (resource, generation) = self.acquire(key, loader)?;
        Ok(PoolLease::new(self, key.to_string(), generation, resource))
    }

    /// Mark one checkout as finished; the entry stays cached
    pub fn release(&self, key: &str) {
        self.release_matching(key, None);
    }

    /// Release a lease, unless its entry was evicted and `key` reloaded since
    pub(crate) fn release_generation(&self, key: &str, generation: u64) {
        self.release_matching(key, Some(generation));
    }

    fn release_matching(&self, key: &str, generation: Option<u64>) {
        let mut state = self.state.lock();
        match state.entries.get_mut(key) {
            Some(entry) if generation.map_or(true, |g| g == entry.seq) => {
                entry.last_used = Instant::now();
                entry.active = entry.active.saturating_sub(1);
                debug!("Resource released: {} (active={})", key, entry.active);
            }
            Some(_) => debug!("Stale release of {} ignored, entry was reloaded", key),
            None => {}
        }
    }

    /// Remove `key` now, running its cleanup. False if it was not cached.
    pub fn evict(&self, key: &str) -> bool {
        let evicted = self.state.lock().evict(key, "requested");
        if !evicted {
            warn!("Resource not in pool: {}", key);
        }
        evicted
    }

    /// Run one idle sweep immediately
    pub fn evict_idle(&self) -> usize {
        self.state.lock().evict_idle(self.config.idle_timeout)
    }

    /// Drop every entry nobody has checked out, regardless of age
    pub fn evict_inactive(&self) -> usize {
        let evicted = self
            .state
            .lock()
            .evict_where("inactive", |entry| entry.active == 0);
        if evicted > 0 {
            info!("Released {} inactive resource(s) under memory pressure", evicted);
        }
        evicted
    }

    /// Unload everything; the pool stays usable
    pub fn clear(&self) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        info!("Clearing resource pool ({} entries)...", state.entries.len());
        for (key, entry) in state.entries.drain() {
            state.evictions += 1;
            close_quietly(&key, entry.resource.as_ref());
            info!("Cleared resource: {}", key);
        }
    }

    /// Stop the idle sweep, unload everything and refuse further `get` calls
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Shutting down ResourcePool...");
        self.stop_sweeper();
        self.clear();
        info!("ResourcePool shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Cached keys, least recently used first
    pub fn keys(&self) -> Vec<String> {
        let state = self.state.lock();
        let mut entries: Vec<(&String, &ResourceEntry<R>)> = state.entries.iter().collect();
        entries.sort_by_key(|(_, entry)| (entry.last_used, entry.seq));
        entries.into_iter().map(|(key, _)| key.clone()).collect()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.state.lock().entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        let lookups = state.cache_hits + state.cache_misses;
        let hit_rate_percent = if lookups > 0 {
            state.cache_hits as f64 / lookups as f64 * 100.0
        } else {
            0.0
        };

        let mut entries: Vec<EntrySnapshot> = state
            .entries
            .iter()
            .map(|(key, entry)| EntrySnapshot {
                key: key.clone(),
                load_time_secs: entry.load_time.as_secs_f64(),
                age_secs: entry.loaded_at.elapsed().as_secs_f64(),
                idle_secs: entry.last_used.elapsed().as_secs_f64(),
                access_count: entry.access_count,
                active: entry.active,
                approx_memory_mb: entry.approx_memory_mb,
            })
            .collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));

        PoolStats {
            size: state.entries.len(),
            max_entries: self.config.max_entries,
            total_loads: state.total_loads,
            cache_hits: state.cache_hits,
            cache_misses: state.cache_misses,
            hit_rate_percent,
            evictions: state.evictions,
            total_memory_mb: state
                .entries
                .values()
                .filter_map(|entry| entry.approx_memory_mb)
                .sum(),
            entries,
        }
    }
}

impl<R: Closeable + 'static> Drop for ResourcePool<R> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntrySnapshot {
    pub key: String,
    pub load_time_secs: f64,
    pub age_secs: f64,
    pub idle_secs: f64,
    pub access_count: u64,
    pub active: usize,
    pub approx_memory_mb: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolStats {
    pub size: usize,
    pub max_entries: usize,
    pub total_loads: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub hit_rate_percent: f64,
    pub evictions: u64,
    pub total_memory_mb: f64,
    pub entries: Vec<EntrySnapshot>,
}
