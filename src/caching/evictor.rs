//! Background eviction for the beacon cache.
//!
//! Two independent bounds are enforced on every pass:
//!
//! 1. **Record age**: records older than `max_record_age` are dropped from
//!    every key, live or staged. Runs at most once per `max_record_age`.
//! 2. **Memory watermarks**: once the cache grows beyond the upper boundary,
//!    the oldest live record of every key is dropped round-robin until the
//!    cache is at or below the lower boundary. The gap between the two
//!    boundaries keeps the evictor from firing on every insert near the limit.
//!
//! The evictor wakes whenever a record is added and at least once per
//! `max_record_age`.

use log::{debug, info, warn};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use super::cache::BeaconCache;
use crate::config::BeaconCacheConfig;
use crate::types::{duration_ms, now_ms, CompletionLatch, ShutdownSignal};

/// Wake-up period when age eviction is disabled.
const IDLE_WAKE_INTERVAL: Duration = Duration::from_secs(60);

// ================================================================================================
// STRATEGIES
// ================================================================================================

/// Drops records older than the configured maximum age.
#[derive(Debug)]
struct TimeEvictionStrategy {
    max_record_age_ms: u64,
    last_run_ms: Option<u64>,
}

impl TimeEvictionStrategy {
    fn new(max_record_age: Duration) -> Self {
        Self {
            max_record_age_ms: duration_ms(max_record_age),
            last_run_ms: None,
        }
    }

    fn is_disabled(&self) -> bool {
        self.max_record_age_ms == 0
    }

    fn should_run(&self, now: u64) -> bool {
        !self.is_disabled()
            && self
                .last_run_ms
                .map_or(true, |last| now.saturating_sub(last) >= self.max_record_age_ms)
    }

    fn execute(&mut self, cache: &BeaconCache, now: u64) -> usize {
        if !self.should_run(now) {
            return 0;
        }

        let cutoff = now.saturating_sub(self.max_record_age_ms);
        let mut removed = 0;
        for key in cache.beacon_keys() {
            removed += cache.remove_live_records_older_than(key, cutoff);
            removed += cache.remove_records_older_than(key, cutoff);
        }
        self.last_run_ms = Some(now);

        if removed > 0 {
            info!("Age eviction removed {} records older than {} ms", removed, self.max_record_age_ms);
        }
        removed
    }
}

/// Keeps the cache between the lower and upper memory boundary.
#[derive(Debug)]
struct SpaceEvictionStrategy {
    lower_boundary_bytes: u64,
    upper_boundary_bytes: u64,
}

impl SpaceEvictionStrategy {
    fn new(config: &BeaconCacheConfig) -> Self {
        Self {
            lower_boundary_bytes: config.lower_memory_boundary_bytes,
            upper_boundary_bytes: config.upper_memory_boundary_bytes,
        }
    }

    fn is_disabled(&self) -> bool {
        self.upper_boundary_bytes == 0 || self.lower_boundary_bytes > self.upper_boundary_bytes
    }

    fn execute(&self, cache: &BeaconCache, shutdown: &ShutdownSignal) -> usize {
        if self.is_disabled() || cache.num_bytes_in_cache() <= self.upper_boundary_bytes {
            return 0;
        }

        debug!(
            "Cache size {} bytes exceeds upper boundary {}, evicting",
            cache.num_bytes_in_cache(),
            self.upper_boundary_bytes
        );

        let mut removed = 0;
        while !shutdown.is_requested() && cache.num_bytes_in_cache() > self.lower_boundary_bytes {
            let removed_in_pass: usize = cache
                .beacon_keys()
                .into_iter()
                .map(|key| cache.remove_oldest_records(key, 1))
                .sum();
            if removed_in_pass == 0 {
                // whatever is left is staged for sending
                warn!(
                    "Space eviction stalled at {} bytes, remaining data is being sent",
                    cache.num_bytes_in_cache()
                );
                break;
            }
            removed += removed_in_pass;
        }

        info!(
            "Space eviction removed {} records, cache now {} bytes",
            removed,
            cache.num_bytes_in_cache()
        );
        removed
    }
}

// ================================================================================================
// EVICTOR
// ================================================================================================

struct Worker {
    shutdown: Arc<ShutdownSignal>,
    handle: Mutex<Option<JoinHandle<()>>>,
    stopped: Arc<CompletionLatch>,
}

/// Background task enforcing the cache bounds.
pub struct CacheEvictor {
    cache: Arc<BeaconCache>,
    config: BeaconCacheConfig,
    worker: Mutex<Option<Arc<Worker>>>,
}

impl CacheEvictor {
    pub fn new(cache: Arc<BeaconCache>, config: BeaconCacheConfig) -> Self {
        Self {
            cache,
            config,
            worker: Mutex::new(None),
        }
    }

    /// Spawns the eviction task. Returns `false` if it is already running.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> bool {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            debug!("Cache evictor already running");
            return false;
        }

        let shutdown = Arc::new(ShutdownSignal::new());
        let stopped = Arc::new(CompletionLatch::new());
        let handle = tokio::spawn(Self::run(
            Arc::clone(&self.cache),
            self.config.clone(),
            Arc::clone(&shutdown),
            Arc::clone(&stopped),
        ));
        *worker = Some(Arc::new(Worker {
            shutdown,
            handle: Mutex::new(Some(handle)),
            stopped,
        }));
        true
    }

    /// Stops the eviction task and waits until it has exited. Every
    /// concurrent caller waits for the same exit.
    ///
    /// Returns `false` if it was not running when called.
    pub async fn stop(&self) -> bool {
        let Some(worker) = self.worker.lock().clone() else {
            return false;
        };
        worker.shutdown.request();

        let handle = worker.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Cache evictor task ended abnormally: {}", e);
            }
            worker.stopped.complete();
        }
        worker.stopped.wait().await;

        // a restart may already have installed a new worker
        let mut slot = self.worker.lock();
        if slot.as_ref().is_some_and(|current| Arc::ptr_eq(current, &worker)) {
            *slot = None;
        }
        true
    }

    pub fn is_alive(&self) -> bool {
        self.worker
            .lock()
            .as_ref()
            .map(|worker| !worker.stopped.is_complete())
            .unwrap_or(false)
    }

    async fn run(
        cache: Arc<BeaconCache>,
        config: BeaconCacheConfig,
        shutdown: Arc<ShutdownSignal>,
        stopped: Arc<CompletionLatch>,
    ) {
        info!(
            "Starting cache evictor (max age {:?}, boundaries {}..{} bytes)",
            config.max_record_age, config.lower_memory_boundary_bytes, config.upper_memory_boundary_bytes
        );

        let mut time_strategy = TimeEvictionStrategy::new(config.max_record_age);
        let space_strategy = SpaceEvictionStrategy::new(&config);
        let wake_interval = if config.max_record_age.is_zero() {
            IDLE_WAKE_INTERVAL
        } else {
            config.max_record_age
        };

        while !shutdown.is_requested() {
            time_strategy.execute(&cache, now_ms());
            space_strategy.execute(&cache, &shutdown);

            tokio::select! {
                _ = shutdown.wait() => break,
                _ = cache.record_added().notified() => {}
                _ = tokio::time::sleep(wake_interval) => {}
            }
        }

        stopped.complete();
        info!("Cache evictor stopped");
    }
}
