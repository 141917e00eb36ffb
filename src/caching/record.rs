//! A single serialized beacon record.

/// Bytes accounted per character of record data.
const BYTES_PER_CHAR: u64 = 2;

/// One serialized event or action, timestamped at the moment it was reported.
///
/// The payload is immutable after creation. The only mutable bit is the
/// `marked_for_sending` flag, set when the record was included in the last
/// chunk handed to the network sender.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheRecord {
    timestamp: u64,
    data: String,
    size_in_bytes: u64,
    marked_for_sending: bool,
}

impl CacheRecord {
    pub fn new(timestamp: u64, data: impl Into<String>) -> Self {
        let data = data.into();
        let size_in_bytes = data.chars().count() as u64 * BYTES_PER_CHAR;
        Self {
            timestamp,
            data,
            size_in_bytes,
            marked_for_sending: false,
        }
    }

    #[inline]
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    #[inline]
    pub fn data(&self) -> &str {
        &self.data
    }

    #[inline]
    pub fn size_in_bytes(&self) -> u64 {
        self.size_in_bytes
    }

    #[inline]
    pub fn is_marked_for_sending(&self) -> bool {
        self.marked_for_sending
    }

    pub(crate) fn mark_for_sending(&mut self) {
        self.marked_for_sending = true;
    }

    pub(crate) fn unmark_for_sending(&mut self) {
        self.marked_for_sending = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_is_two_bytes_per_char() {
        assert_eq!(CacheRecord::new(0, "contents_1").size_in_bytes(), 20);
        assert_eq!(CacheRecord::new(0, "").size_in_bytes(), 0);
        assert_eq!(CacheRecord::new(0, "äö").size_in_bytes(), 4);
    }

    #[test]
    fn test_marking() {
        let mut record = CacheRecord::new(17, "a");
        assert!(!record.is_marked_for_sending());
        record.mark_for_sending();
        assert!(record.is_marked_for_sending());
        record.unmark_for_sending();
        assert!(!record.is_marked_for_sending());
        assert_eq!(record.timestamp(), 17);
        assert_eq!(record.data(), "a");
    }
}
