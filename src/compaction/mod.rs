//! Compaction Module
//!
//! Reclaims disk space held by overwritten, deleted and expired records.
//!
//! ## Responsibilities
//! - Track per-segment usage (records, dead, tombstones)
//! - Pick sealed segments whose live fraction fell below the threshold
//! - Copy live records forward through the writer, then delete the segment
//!
//! ## Record Rules
//! ```text
//! value, indexed here, not expired  → Relocate
//! value, indexed here, expired      → Expire (tombstone + index removal)
//! tombstone, key absent, not oldest → CarryTombstone
//! anything else                     → dropped
//! ```

mod compactor;
mod usage;

pub use compactor::{CompactionReport, Compactor, CompactorHandle};
pub use usage::{SegmentUsage, UsageTracker};
