//! Per-session record buffer with a staged snapshot for sending.

use super::record::CacheRecord;

/// Buffered records of one beacon key.
///
/// Records land in the live lists. [`copy_data_for_sending`](Self::copy_data_for_sending)
/// moves them to the staged lists, which is what chunks are built from.
/// Anything appended afterwards stays live until the next copy, so a record
/// is never part of two cycles.
///
/// Invariant: `total_bytes` equals the summed size of all four lists.
#[derive(Debug, Default)]
pub struct CacheEntry {
    event_data: Vec<CacheRecord>,
    action_data: Vec<CacheRecord>,
    event_data_being_sent: Vec<CacheRecord>,
    action_data_being_sent: Vec<CacheRecord>,
    total_bytes: u64,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Source {
    Event,
    Action,
}

impl CacheEntry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_event_data(&mut self, record: CacheRecord) {
        self.total_bytes += record.size_in_bytes();
        self.event_data.push(record);
    }

    pub fn add_action_data(&mut self, record: CacheRecord) {
        self.total_bytes += record.size_in_bytes();
        self.action_data.push(record);
    }

    /// Moves all live records behind the staged ones and clears the live lists.
    pub fn copy_data_for_sending(&mut self) {
        self.event_data_being_sent.append(&mut self.event_data);
        self.action_data_being_sent.append(&mut self.action_data);
    }

    /// Builds `prefix` followed by staged records, oldest first, each
    /// preceded by `delimiter`.
    ///
    /// Records are added while the chunk stays within `max_size` bytes; the
    /// first record is always added so an oversized record cannot stall the
    /// pipeline. Included records are marked for sending. Calling this again
    /// without removing marked data yields the same chunk.
    pub fn get_chunk(&mut self, prefix: &str, max_size: usize, delimiter: char) -> String {
        if !self.has_data_to_send() {
            return String::new();
        }

        let order = Self::chronological_order(&self.event_data_being_sent, &self.action_data_being_sent);

        let mut chunk = String::with_capacity(max_size.min(64 * 1024));
        chunk.push_str(prefix);
        let mut included = 0usize;
        for (source, index) in order {
            let record = match source {
                Source::Event => &mut self.event_data_being_sent[index],
                Source::Action => &mut self.action_data_being_sent[index],
            };
            let added = delimiter.len_utf8() + record.data().len();
            if included > 0 && chunk.len() + added > max_size {
                break;
            }
            chunk.push(delimiter);
            chunk.push_str(record.data());
            record.mark_for_sending();
            included += 1;
        }

        chunk
    }

    /// Drops staged records included in a chunk. Returns the freed bytes.
    pub fn remove_data_marked_for_sending(&mut self) -> u64 {
        let mut freed = 0u64;
        for list in [&mut self.event_data_being_sent, &mut self.action_data_being_sent] {
            list.retain(|record| {
                if record.is_marked_for_sending() {
                    freed += record.size_in_bytes();
                    false
                } else {
                    true
                }
            });
        }
        self.total_bytes -= freed;
        freed
    }

    /// Clears the marks so the next chunk starts over with all staged records.
    pub fn reset_data_marked_for_sending(&mut self) {
        self.event_data_being_sent
            .iter_mut()
            .chain(self.action_data_being_sent.iter_mut())
            .for_each(CacheRecord::unmark_for_sending);
    }

    /// Evicts up to `count` of the oldest live records, events and actions
    /// merged by timestamp. Staged records are never touched.
    ///
    /// Returns the number of evicted records.
    pub fn remove_oldest_records(&mut self, count: usize) -> usize {
        let mut removed = 0;
        while removed < count {
            let oldest_event = Self::oldest_index(&self.event_data);
            let oldest_action = Self::oldest_index(&self.action_data);

            let record = match (oldest_event, oldest_action) {
                (None, None) => break,
                (Some(e), None) => self.event_data.remove(e),
                (None, Some(a)) => self.action_data.remove(a),
                (Some(e), Some(a)) => {
                    if self.event_data[e].timestamp() <= self.action_data[a].timestamp() {
                        self.event_data.remove(e)
                    } else {
                        self.action_data.remove(a)
                    }
                }
            };
            self.total_bytes -= record.size_in_bytes();
            removed += 1;
        }
        removed
    }

    /// Evicts staged records with a timestamp strictly older than `cutoff`.
    /// Live records are never touched.
    pub fn remove_records_older_than(&mut self, cutoff: u64) -> usize {
        let (removed, freed) = Self::retain_newer(
            [&mut self.event_data_being_sent, &mut self.action_data_being_sent],
            cutoff,
        );
        self.total_bytes -= freed;
        removed
    }

    /// Evicts live records with a timestamp strictly older than `cutoff`.
    pub fn remove_live_records_older_than(&mut self, cutoff: u64) -> usize {
        let (removed, freed) = Self::retain_newer([&mut self.event_data, &mut self.action_data], cutoff);
        self.total_bytes -= freed;
        removed
    }

    /// True while a staged snapshot is waiting to be sent.
    #[inline]
    pub fn has_data_to_send(&self) -> bool {
        !self.event_data_being_sent.is_empty() || !self.action_data_being_sent.is_empty()
    }

    /// True when the next chunk must first take a new snapshot.
    #[inline]
    pub fn needs_data_copy_before_chunking(&self) -> bool {
        !self.has_data_to_send()
    }

    pub fn is_empty(&self) -> bool {
        self.event_data.is_empty() && self.action_data.is_empty() && !self.has_data_to_send()
    }

    #[inline]
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn live_event_count(&self) -> usize {
        self.event_data.len()
    }

    pub fn live_action_count(&self) -> usize {
        self.action_data.len()
    }

    pub fn staged_event_count(&self) -> usize {
        self.event_data_being_sent.len()
    }

    pub fn staged_action_count(&self) -> usize {
        self.action_data_being_sent.len()
    }

    pub fn record_count(&self) -> usize {
        self.live_event_count()
            + self.live_action_count()
            + self.staged_event_count()
            + self.staged_action_count()
    }

    // ============================================================================================
    // HELPERS
    // ============================================================================================

    fn oldest_index(records: &[CacheRecord]) -> Option<usize> {
        records
            .iter()
            .enumerate()
            .min_by_key(|(_, record)| record.timestamp())
            .map(|(index, _)| index)
    }

    /// Staged records ordered by timestamp; events win ties.
    fn chronological_order(events: &[CacheRecord], actions: &[CacheRecord]) -> Vec<(Source, usize)> {
        let mut order: Vec<(u64, Source, usize)> = events
            .iter()
            .enumerate()
            .map(|(i, r)| (r.timestamp(), Source::Event, i))
            .chain(actions.iter().enumerate().map(|(i, r)| (r.timestamp(), Source::Action, i)))
            .collect();
        // stable: insertion order is kept for equal timestamps within a list
        order.sort_by_key(|(timestamp, source, _)| (*timestamp, *source == Source::Action));
        order.into_iter().map(|(_, source, index)| (source, index)).collect()
    }

    fn retain_newer(lists: [&mut Vec<CacheRecord>; 2], cutoff: u64) -> (usize, u64) {
        let mut removed = 0usize;
        let mut freed = 0u64;
        for list in lists {
            list.retain(|record| {
                if record.timestamp() < cutoff {
                    removed += 1;
                    freed += record.size_in_bytes();
                    false
                } else {
                    true
                }
            });
        }
        (removed, freed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE_MS: u64 = 60_000;
    const NOW: u64 = 1_700_000_000_000;

    fn record(timestamp: u64, data: &str) -> CacheRecord {
        CacheRecord::new(timestamp, data)
    }

    #[test]
    fn test_entry_data_manipulation() {
        let mut entry = CacheEntry::new();

        entry.add_event_data(record(NOW, "contents_1"));
        assert_eq!(entry.total_bytes(), 20);
        assert_eq!(entry.live_event_count(), 1);

        entry.add_action_data(record(NOW - 10 * MINUTE_MS, "contents_2"));
        assert_eq!(entry.total_bytes(), 40);
        assert_eq!(entry.live_action_count(), 1);

        entry.copy_data_for_sending();
        assert_eq!(entry.live_event_count(), 0);
        assert_eq!(entry.live_action_count(), 0);
        assert_eq!(entry.staged_event_count(), 1);
        assert_eq!(entry.staged_action_count(), 1);
        assert_eq!(entry.total_bytes(), 40);

        assert_eq!(entry.remove_records_older_than(NOW - 9 * MINUTE_MS), 1);
        assert_eq!(entry.staged_action_count(), 0);
        assert_eq!(entry.staged_event_count(), 1);
        assert_eq!(entry.total_bytes(), 20);

        entry.add_event_data(record(NOW, "contents_3"));
        entry.add_action_data(record(NOW - 10 * MINUTE_MS, "contents_4"));

        assert_eq!(entry.remove_oldest_records(1), 1);
        assert_eq!(entry.live_action_count(), 0);
        assert_eq!(entry.live_event_count(), 1);

        let chunk = entry.get_chunk("prefix", 30 * 1024, '&');
        assert_eq!(chunk, "prefix&contents_1");

        entry.remove_data_marked_for_sending();
        assert_eq!(entry.staged_event_count(), 0);
        assert_eq!(entry.staged_action_count(), 0);
        // contents_3 is still live
        assert_eq!(entry.total_bytes(), 20);
    }

    #[test]
    fn test_chunk_is_oldest_first_and_idempotent() {
        let mut entry = CacheEntry::new();
        entry.add_event_data(record(300, "e3"));
        entry.add_action_data(record(100, "a1"));
        entry.add_event_data(record(200, "e2"));
        entry.copy_data_for_sending();

        let first = entry.get_chunk("p", 1024, '&');
        assert_eq!(first, "p&a1&e2&e3");
        let second = entry.get_chunk("p", 1024, '&');
        assert_eq!(first, second);
        assert_eq!(entry.staged_event_count(), 2);
        assert_eq!(entry.staged_action_count(), 1);
    }

    #[test]
    fn test_chunk_respects_max_size_and_drains_in_batches() {
        let mut entry = CacheEntry::new();
        for i in 0..5u64 {
            entry.add_event_data(record(i, &format!("record{}", i)));
        }
        entry.copy_data_for_sending();

        // "p" + 2 x "&recordN" = 1 + 16
        let chunk = entry.get_chunk("p", 17, '&');
        assert_eq!(chunk, "p&record0&record1");
        entry.remove_data_marked_for_sending();

        let chunk = entry.get_chunk("p", 17, '&');
        assert_eq!(chunk, "p&record2&record3");
        entry.remove_data_marked_for_sending();

        let chunk = entry.get_chunk("p", 17, '&');
        assert_eq!(chunk, "p&record4");
        entry.remove_data_marked_for_sending();

        assert_eq!(entry.get_chunk("p", 17, '&'), "");
        assert!(entry.is_empty());
        assert_eq!(entry.total_bytes(), 0);
    }

    #[test]
    fn test_oversized_record_is_still_chunked() {
        let mut entry = CacheEntry::new();
        entry.add_event_data(record(1, "a-rather-long-record"));
        entry.copy_data_for_sending();
        assert_eq!(entry.get_chunk("p", 4, '&'), "p&a-rather-long-record");
    }

    #[test]
    fn test_records_appended_after_copy_stay_live() {
        let mut entry = CacheEntry::new();
        entry.add_event_data(record(1, "before"));
        entry.copy_data_for_sending();
        entry.add_event_data(record(2, "after"));

        assert_eq!(entry.get_chunk("p", 1024, '&'), "p&before");
        entry.remove_data_marked_for_sending();
        assert_eq!(entry.live_event_count(), 1);
        assert_eq!(entry.get_chunk("p", 1024, '&'), "");
        assert!(entry.needs_data_copy_before_chunking());

        entry.copy_data_for_sending();
        assert_eq!(entry.get_chunk("p", 1024, '&'), "p&after");
    }

    #[test]
    fn test_copy_keeps_unsent_staged_records() {
        let mut entry = CacheEntry::new();
        entry.add_event_data(record(1, "one"));
        entry.copy_data_for_sending();
        entry.add_event_data(record(2, "two"));
        entry.copy_data_for_sending();

        assert_eq!(entry.staged_event_count(), 2);
        assert_eq!(entry.get_chunk("p", 1024, '&'), "p&one&two");
    }

    #[test]
    fn test_reset_unmarks_staged_records() {
        let mut entry = CacheEntry::new();
        entry.add_event_data(record(1, "one"));
        entry.copy_data_for_sending();
        entry.get_chunk("p", 1024, '&');

        entry.reset_data_marked_for_sending();
        assert_eq!(entry.remove_data_marked_for_sending(), 0);
        assert_eq!(entry.staged_event_count(), 1);
    }

    #[test]
    fn test_remove_records_older_than_ignores_live_records() {
        let mut entry = CacheEntry::new();
        entry.add_event_data(record(1, "old-staged"));
        entry.copy_data_for_sending();
        entry.add_event_data(record(2, "old-live"));

        assert_eq!(entry.remove_records_older_than(100), 1);
        assert_eq!(entry.live_event_count(), 1);
        assert_eq!(entry.staged_event_count(), 0);

        assert_eq!(entry.remove_live_records_older_than(100), 1);
        assert!(entry.is_empty());
        assert_eq!(entry.total_bytes(), 0);
    }

    #[test]
    fn test_remove_records_older_than_is_strict() {
        let mut entry = CacheEntry::new();
        entry.add_action_data(record(100, "at-cutoff"));
        entry.add_action_data(record(99, "before-cutoff"));
        entry.copy_data_for_sending();

        assert_eq!(entry.remove_records_older_than(100), 1);
        assert_eq!(entry.get_chunk("", 1024, '&'), "&at-cutoff");
    }

    #[test]
    fn test_remove_oldest_records_merges_lists() {
        let mut entry = CacheEntry::new();
        entry.add_event_data(record(5, "e5"));
        entry.add_action_data(record(1, "a1"));
        entry.add_event_data(record(3, "e3"));
        entry.add_action_data(record(4, "a4"));

        assert_eq!(entry.remove_oldest_records(3), 3);
        assert_eq!(entry.live_event_count(), 1);
        assert_eq!(entry.live_action_count(), 0);

        // more than available
        assert_eq!(entry.remove_oldest_records(10), 1);
        assert_eq!(entry.total_bytes(), 0);
    }

    #[test]
    fn test_remove_oldest_records_skips_staged() {
        let mut entry = CacheEntry::new();
        entry.add_event_data(record(1, "staged"));
        entry.copy_data_for_sending();
        assert_eq!(entry.remove_oldest_records(1), 0);
        assert_eq!(entry.staged_event_count(), 1);
    }
}
