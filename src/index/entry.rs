//! Index entries

use serde::{Deserialize, Serialize};

use crate::clock;
use crate::log::{Location, Record};

/// Hash used to bucket keys; collisions are resolved against the log
#[inline]
pub fn key_hash(key: &[u8]) -> u32 {
    crc32fast::hash(key)
}

/// Where the current record for a key lives, plus what is needed to filter
/// it without touching the log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub hash: u32,
    pub location: Location,
    pub expiry: i64,
    pub cache_segment: u32,
}

impl IndexEntry {
    pub fn new(key: &[u8], location: Location, expiry: i64, cache_segment: u32) -> Self {
        Self {
            hash: key_hash(key),
            location,
            expiry,
            cache_segment,
        }
    }

    /// Entry for `record` freshly appended at `location`
    pub fn for_record(record: &Record, location: Location) -> Self {
        Self::new(&record.key, location, record.expiry, record.cache_segment)
    }

    pub fn is_expired(&self, now: i64) -> bool {
        clock::is_expired(self.expiry, now)
    }
}
