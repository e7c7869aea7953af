//! Per-segment usage counters
//!
//! Every applied mutation feeds these counters so the compactor can estimate
//! how much of a sealed segment is still live without reading it.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Counters for one segment
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentUsage {
    /// Frames appended to the segment
    pub records: u64,
    /// Value frames superseded, deleted or expired since
    pub dead: u64,
    /// Tombstone frames
    pub tombstones: u64,
}

impl SegmentUsage {
    /// Estimated fraction of frames still worth keeping
    ///
    /// Tombstones have to survive until no older segment of the partition
    /// could hold a value they shadow, so they only count as dead in the
    /// oldest segment of the partition.
    pub fn live_fraction(&self, oldest_in_partition: bool) -> f64 {
        if self.records == 0 {
            return 0.0;
        }
        let mut reclaimable = self.dead;
        if oldest_in_partition {
            reclaimable += self.tombstones;
        }
        let live = self.records.saturating_sub(reclaimable);
        live as f64 / self.records as f64
    }
}

/// Thread-safe map of segment id → [`SegmentUsage`]
#[derive(Debug, Default)]
pub struct UsageTracker {
    segments: Mutex<HashMap<u64, SegmentUsage>>,
}

impl UsageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// A frame landed in `segment`
    pub fn record_append(&self, segment: u64, tombstone: bool) {
        let mut segments = self.segments.lock();
        let usage = segments.entry(segment).or_default();
        usage.records += 1;
        if tombstone {
            usage.tombstones += 1;
        }
    }

    /// A value frame in `segment` is no longer referenced by the index
    pub fn record_dead(&self, segment: u64) {
        let mut segments = self.segments.lock();
        segments.entry(segment).or_default().dead += 1;
    }

    pub fn get(&self, segment: u64) -> SegmentUsage {
        self.segments
            .lock()
            .get(&segment)
            .copied()
            .unwrap_or_default()
    }

    pub fn remove(&self, segment: u64) {
        self.segments.lock().remove(&segment);
    }

    pub fn clear(&self) {
        self.segments.lock().clear();
    }

    /// All counters ordered by segment id, as stored in checkpoints
    pub fn snapshot(&self) -> Vec<(u64, SegmentUsage)> {
        let mut out: Vec<_> = self
            .segments
            .lock()
            .iter()
            .map(|(id, usage)| (*id, *usage))
            .collect();
        out.sort_unstable_by_key(|(id, _)| *id);
        out
    }

    /// Replace all counters with a checkpointed set
    pub fn restore(&self, usage: Vec<(u64, SegmentUsage)>) {
        let mut segments = self.segments.lock();
        segments.clear();
        segments.extend(usage);
    }
}
