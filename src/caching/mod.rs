//! Beacon record caching.
//!
//! - [`record`]: one serialized, timestamped record
//! - [`entry`]: the records of one beacon key, live and staged for sending
//! - [`cache`]: the concurrent key → entry map
//! - [`evictor`]: background task bounding record age and total memory

pub mod cache;
pub mod entry;
pub mod evictor;
pub mod record;

pub use cache::{BeaconCache, CacheStats};
pub use entry::CacheEntry;
pub use evictor::CacheEvictor;
pub use record::CacheRecord;
