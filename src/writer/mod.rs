//! Writer Module
//!
//! Every mutation of the store goes through one thread.
//!
//! ## Responsibilities
//! - Serialize writes, deletes and compaction copies into a single commit
//!   order (log append, then index update, then reply)
//! - Keep the usage counters in step with the index
//! - Periodic and final index checkpoints
//!
//! ## Flow
//! ```text
//! caller ──submit──► [bounded queue] ──► writer thread ──► LogManager::append
//!    ▲                                        │            IndexManager::upsert/remove
//!    └──────────── reply (bounded(1)) ◄───────┘
//! ```

mod applier;
mod coordinator;

pub use applier::Applier;
pub use coordinator::{StartupTask, WriteCoordinator};

use bytes::Bytes;

use crate::log::{Location, Record};

/// One unit of work for the writer thread
#[derive(Debug, Clone)]
pub enum Mutation {
    /// Store a value record
    Write(Record),
    /// Append a tombstone if the key is present
    Delete { key: Bytes, cache_segment: u32 },
    /// Writes and deletes applied back to back, in order
    Batch(Vec<BatchOp>),
    /// Compaction copy; skipped unless the index still points at `from`
    Relocate { record: Record, from: Location },
    /// Compaction removal of an expired record still indexed at `from`
    Expire {
        key: Bytes,
        cache_segment: u32,
        from: Location,
    },
    /// Compaction copy of a tombstone whose key is still absent
    CarryTombstone { key: Bytes, cache_segment: u32 },
    /// Drop every segment and index entry
    Clear,
    /// Flush the index and write a checkpoint
    Checkpoint,
}

/// Operations allowed inside a [`Mutation::Batch`]
#[derive(Debug, Clone)]
pub enum BatchOp {
    Write(Record),
    Delete { key: Bytes, cache_segment: u32 },
}

/// Result of an applied mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Written(Location),
    /// Whether a live entry was removed
    Removed(bool),
    /// Whether the compaction copy was applied
    Relocated(bool),
    /// Number of batch operations that changed something
    Batched(usize),
    Cleared,
    Checkpointed,
}
