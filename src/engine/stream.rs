//! Snapshot iteration
//!
//! An [`EntryStream`] is built from a copy of the index taken when the
//! iteration starts. Every segment the copy refers to is pinned, so
//! compaction can delete segments underneath it without the stream losing
//! records. Dropping the stream releases the pins.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{EmberError, Result};
use crate::index::IndexEntry;
use crate::log::Segment;

use super::entry::{IterateOptions, PublishedEntry};

/// Lazy, restartable iteration over a point-in-time view of the store
pub struct EntryStream {
    entries: Arc<Vec<IndexEntry>>,
    pins: Arc<HashMap<u64, Arc<Segment>>>,
    options: IterateOptions,
    position: usize,
}

impl EntryStream {
    pub(crate) fn new(
        entries: Vec<IndexEntry>,
        pins: HashMap<u64, Arc<Segment>>,
        options: IterateOptions,
    ) -> Self {
        Self {
            entries: Arc::new(entries),
            pins: Arc::new(pins),
            options,
            position: 0,
        }
    }

    /// A fresh pass over the same snapshot
    pub fn restart(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
            pins: Arc::clone(&self.pins),
            options: self.options.clone(),
            position: 0,
        }
    }

    /// Entries in the snapshot, before the key filter is applied
    pub fn snapshot_len(&self) -> usize {
        self.entries.len()
    }

    pub fn pinned_segments(&self) -> usize {
        self.pins.len()
    }

    fn publish(&self, entry: &IndexEntry) -> Result<Option<PublishedEntry>> {
        let segment = self
            .pins
            .get(&entry.location.segment)
            .ok_or(EmberError::SegmentNotFound(entry.location.segment))?;
        let record = segment.read(&entry.location)?;
        if record.is_tombstone() || !self.options.wants_key(&record.key) {
            return Ok(None);
        }
        Ok(Some(PublishedEntry {
            key: record.key,
            value: if self.options.fetch_value { record.value } else { None },
            metadata: if self.options.fetch_metadata {
                record.metadata
            } else {
                None
            },
            expiry: entry.expiry,
            cache_segment: entry.cache_segment,
        }))
    }
}

impl Iterator for EntryStream {
    type Item = Result<PublishedEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.position < self.entries.len() {
            let entry = self.entries[self.position];
            self.position += 1;
            match self.publish(&entry) {
                Ok(Some(published)) => return Some(Ok(published)),
                Ok(None) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
        None
    }
}
