//! # Beacon Cache
//!
//! Thread-safe map of beacon key → [`CacheEntry`].
//!
//! The map sits behind a read/write lock and each entry behind its own
//! mutex. Reporting threads take the map lock shared (exclusive only on the
//! first insert for a key) and then lock just the entry they append to, so
//! appends for different sessions never contend with each other. No lock is
//! held beyond the list mutation itself.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

use super::entry::CacheEntry;
use super::record::CacheRecord;
use crate::types::BeaconKey;

type SharedEntry = Arc<Mutex<CacheEntry>>;

/// Cache statistics
#[derive(Clone, Debug, Default)]
pub struct CacheStats {
    /// Number of beacon keys with an entry
    pub entries: usize,
    /// Bytes currently buffered across all entries
    pub total_bytes: u64,
    /// Records appended since creation
    pub records_added: u64,
    /// Records dropped by eviction since creation
    pub records_evicted: u64,
}

/// Concurrency-safe store of buffered beacon records.
#[derive(Debug, Default)]
pub struct BeaconCache {
    entries: RwLock<HashMap<BeaconKey, SharedEntry>>,
    record_added: Notify,
    records_added: AtomicU64,
    records_evicted: AtomicU64,
}

impl BeaconCache {
    pub fn new() -> Self {
        Self::default()
    }

    // ============================================================================================
    // INSERTION
    // ============================================================================================

    pub fn add_event_data(&self, key: BeaconKey, timestamp: u64, data: impl Into<String>) {
        let record = CacheRecord::new(timestamp, data);
        self.get_or_create_entry(key).lock().add_event_data(record);
        self.on_record_added();
    }

    pub fn add_action_data(&self, key: BeaconKey, timestamp: u64, data: impl Into<String>) {
        let record = CacheRecord::new(timestamp, data);
        self.get_or_create_entry(key).lock().add_action_data(record);
        self.on_record_added();
    }

    /// Woken on every insertion; the evictor waits on it.
    pub(crate) fn record_added(&self) -> &Notify {
        &self.record_added
    }

    // ============================================================================================
    // STAGING AND CHUNKING
    // ============================================================================================

    /// Moves the key's live records into its staged snapshot.
    pub fn copy_data_for_sending(&self, key: BeaconKey) {
        if let Some(entry) = self.get_entry(key) {
            entry.lock().copy_data_for_sending();
        }
    }

    /// Chunk of staged records; empty when nothing is staged or the key is unknown.
    pub fn get_chunk(&self, key: BeaconKey, prefix: &str, max_size: usize, delimiter: char) -> String {
        self.get_entry(key)
            .map(|entry| entry.lock().get_chunk(prefix, max_size, delimiter))
            .unwrap_or_default()
    }

    /// Next chunk to transmit for `key`.
    ///
    /// Takes a fresh snapshot of the live records when nothing is staged,
    /// otherwise keeps chunking the current snapshot. Both happen under one
    /// entry lock.
    pub fn get_next_chunk(&self, key: BeaconKey, prefix: &str, max_size: usize, delimiter: char) -> String {
        let Some(entry) = self.get_entry(key) else {
            return String::new();
        };
        let mut entry = entry.lock();
        if entry.needs_data_copy_before_chunking() {
            entry.copy_data_for_sending();
        }
        entry.get_chunk(prefix, max_size, delimiter)
    }

    /// Drops the staged records of the last chunk after the collector accepted it.
    pub fn remove_data_marked_for_sending(&self, key: BeaconKey) -> u64 {
        self.get_entry(key)
            .map(|entry| entry.lock().remove_data_marked_for_sending())
            .unwrap_or(0)
    }

    /// Alias used by the beacon sender.
    pub fn remove_chunked_data(&self, key: BeaconKey) -> u64 {
        self.remove_data_marked_for_sending(key)
    }

    /// Unmarks the last chunk so it is rebuilt from scratch next time.
    pub fn reset_chunked_data(&self, key: BeaconKey) {
        if let Some(entry) = self.get_entry(key) {
            entry.lock().reset_data_marked_for_sending();
        }
    }

    // ============================================================================================
    // EVICTION
    // ============================================================================================

    /// Evicts the `count` oldest live records of `key`.
    pub fn remove_oldest_records(&self, key: BeaconKey, count: usize) -> usize {
        let removed = self
            .get_entry(key)
            .map(|entry| entry.lock().remove_oldest_records(count))
            .unwrap_or(0);
        self.on_records_evicted(removed);
        removed
    }

    /// Evicts staged records of `key` strictly older than `cutoff`.
    pub fn remove_records_older_than(&self, key: BeaconKey, cutoff: u64) -> usize {
        let removed = self
            .get_entry(key)
            .map(|entry| entry.lock().remove_records_older_than(cutoff))
            .unwrap_or(0);
        self.on_records_evicted(removed);
        removed
    }

    /// Evicts live records of `key` strictly older than `cutoff`.
    pub fn remove_live_records_older_than(&self, key: BeaconKey, cutoff: u64) -> usize {
        let removed = self
            .get_entry(key)
            .map(|entry| entry.lock().remove_live_records_older_than(cutoff))
            .unwrap_or(0);
        self.on_records_evicted(removed);
        removed
    }

    /// Removes the entry of `key` with everything it holds.
    pub fn delete_cache_entry(&self, key: BeaconKey) -> bool {
        self.entries.write().remove(&key).is_some()
    }

    // ============================================================================================
    // QUERIES
    // ============================================================================================

    pub fn beacon_keys(&self) -> Vec<BeaconKey> {
        self.entries.read().keys().copied().collect()
    }

    /// Sum of the byte totals of all entries.
    pub fn num_bytes_in_cache(&self) -> u64 {
        let entries: Vec<SharedEntry> = self.entries.read().values().cloned().collect();
        entries.iter().map(|entry| entry.lock().total_bytes()).sum()
    }

    /// True when `key` has no records (or no entry at all).
    pub fn is_empty(&self, key: BeaconKey) -> bool {
        self.get_entry(key).map(|entry| entry.lock().is_empty()).unwrap_or(true)
    }

    pub fn contains(&self, key: BeaconKey) -> bool {
        self.entries.read().contains_key(&key)
    }

    /// Runs `f` against the entry of `key` while holding its lock.
    pub fn inspect<F, R>(&self, key: BeaconKey, f: F) -> Option<R>
    where
        F: FnOnce(&CacheEntry) -> R,
    {
        self.get_entry(key).map(|entry| f(&entry.lock()))
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.read().len(),
            total_bytes: self.num_bytes_in_cache(),
            records_added: self.records_added.load(Ordering::Relaxed),
            records_evicted: self.records_evicted.load(Ordering::Relaxed),
        }
    }

    // ============================================================================================
    // HELPERS
    // ============================================================================================

    fn get_entry(&self, key: BeaconKey) -> Option<SharedEntry> {
        self.entries.read().get(&key).map(Arc::clone)
    }

    fn get_or_create_entry(&self, key: BeaconKey) -> SharedEntry {
        if let Some(entry) = self.get_entry(key) {
            return entry;
        }
        let mut entries = self.entries.write();
        Arc::clone(entries.entry(key).or_default())
    }

    fn on_record_added(&self) {
        self.records_added.fetch_add(1, Ordering::Relaxed);
        self.record_added.notify_one();
    }

    fn on_records_evicted(&self, count: usize) {
        if count > 0 {
            self.records_evicted.fetch_add(count as u64, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn key(n: u32) -> BeaconKey {
        BeaconKey::new(n, 0)
    }

    #[test]
    fn test_add_creates_entry_and_counts_bytes() {
        let cache = BeaconCache::new();
        assert!(!cache.contains(key(1)));

        cache.add_event_data(key(1), 1000, "contents_1");
        assert!(cache.contains(key(1)));
        assert_eq!(cache.num_bytes_in_cache(), 20);

        cache.add_action_data(key(1), 400, "contents_2");
        assert_eq!(cache.num_bytes_in_cache(), 40);

        cache.add_event_data(key(2), 1000, "x");
        assert_eq!(cache.num_bytes_in_cache(), 42);
        assert_eq!(cache.beacon_keys().len(), 2);
    }

    #[test]
    fn test_staged_chunk_flow() {
        let cache = BeaconCache::new();
        cache.add_event_data(key(1), 1000, "contents_1");
        cache.add_action_data(key(1), 400, "contents_2");

        cache.copy_data_for_sending(key(1));
        let counts = cache
            .inspect(key(1), |e| (e.live_event_count(), e.staged_event_count(), e.staged_action_count()))
            .unwrap();
        assert_eq!(counts, (0, 1, 1));

        assert_eq!(cache.remove_records_older_than(key(1), 500), 1);
        assert_eq!(cache.get_chunk(key(1), "prefix", 30720, '&'), "prefix&contents_1");

        cache.remove_data_marked_for_sending(key(1));
        assert!(cache.is_empty(key(1)));
        // emptied, not removed
        assert!(cache.contains(key(1)));
        assert_eq!(cache.num_bytes_in_cache(), 0);
    }

    #[test]
    fn test_get_next_chunk_snapshots_on_demand() {
        let cache = BeaconCache::new();
        cache.add_event_data(key(1), 1, "a");

        assert_eq!(cache.get_next_chunk(key(1), "p", 1024, '&'), "p&a");
        cache.add_event_data(key(1), 2, "b");
        // staged snapshot not yet drained, "b" waits for the next cycle
        assert_eq!(cache.get_next_chunk(key(1), "p", 1024, '&'), "p&a");

        cache.remove_chunked_data(key(1));
        assert_eq!(cache.get_next_chunk(key(1), "p", 1024, '&'), "p&b");
        cache.remove_chunked_data(key(1));
        assert_eq!(cache.get_next_chunk(key(1), "p", 1024, '&'), "");
    }

    #[test]
    fn test_mutators_on_unknown_key_are_noops() {
        let cache = BeaconCache::new();
        cache.copy_data_for_sending(key(9));
        assert_eq!(cache.get_chunk(key(9), "p", 10, '&'), "");
        assert_eq!(cache.get_next_chunk(key(9), "p", 10, '&'), "");
        assert_eq!(cache.remove_data_marked_for_sending(key(9)), 0);
        assert_eq!(cache.remove_oldest_records(key(9), 3), 0);
        assert_eq!(cache.remove_records_older_than(key(9), 100), 0);
        cache.reset_chunked_data(key(9));
        assert!(!cache.delete_cache_entry(key(9)));
        assert!(cache.is_empty(key(9)));
        assert!(!cache.contains(key(9)));
    }

    #[test]
    fn test_delete_cache_entry() {
        let cache = BeaconCache::new();
        cache.add_event_data(key(1), 1, "a");
        assert!(cache.delete_cache_entry(key(1)));
        assert!(!cache.contains(key(1)));
        assert_eq!(cache.num_bytes_in_cache(), 0);
    }

    #[test]
    fn test_eviction_statistics() {
        let cache = BeaconCache::new();
        for i in 0..5 {
            cache.add_event_data(key(1), i, "r");
        }
        assert_eq!(cache.remove_oldest_records(key(1), 2), 2);

        let stats = cache.stats();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.records_added, 5);
        assert_eq!(stats.records_evicted, 2);
        assert_eq!(stats.total_bytes, 6);
    }

    #[test]
    fn test_concurrent_appends_and_copies_lose_nothing() {
        let cache = Arc::new(BeaconCache::new());
        let mut handles = vec![];

        for t in 0..8u32 {
            let cache = Arc::clone(&cache);
            handles.push(thread::spawn(move || {
                for i in 0..250u64 {
                    if i % 2 == 0 {
                        cache.add_event_data(key(t % 2), i, "abcd");
                    } else {
                        cache.add_action_data(key(t % 2), i, "abcd");
                    }
                }
            }));
        }

        let copier = {
            let cache = Arc::clone(&cache);
            thread::spawn(move || {
                for _ in 0..100 {
                    cache.copy_data_for_sending(key(0));
                    cache.copy_data_for_sending(key(1));
                }
            })
        };

        for handle in handles {
            handle.join().unwrap();
        }
        copier.join().unwrap();

        // 8 threads x 250 records x 8 bytes
        assert_eq!(cache.num_bytes_in_cache(), 8 * 250 * 8);
        let records: usize = [key(0), key(1)]
            .iter()
            .map(|k| cache.inspect(*k, |e| e.record_count()).unwrap())
            .sum();
        assert_eq!(records, 2000);
    }
}
