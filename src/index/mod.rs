//! Index Module
//!
//! The soft index: a persistent map from key to the location of its latest
//! record in the log.
//!
//! ## Responsibilities
//! - Resolve keys to [`IndexEntry`] values (hash buckets, verified against
//!   the log on every hit)
//! - Keep only a bounded number of pages resident; evicted pages are written
//!   back to `pages/` and reloaded on demand
//! - Checkpoint to disk and decide on startup whether that checkpoint can be
//!   trusted
//!
//! ## Layout
//! ```text
//! {index_location}/
//!   index.chk            checkpoint manifest
//!   pages/page_00000.idx one file per non-empty page
//! ```

mod checkpoint;
mod entry;
mod manager;
mod page;

pub use checkpoint::{IndexCheckpoint, CHECKPOINT_FILE, CHECKPOINT_VERSION};
pub use entry::{key_hash, IndexEntry};
pub use manager::{IndexManager, IndexScan, IndexStats};
pub use page::Page;

use crate::error::Result;
use crate::log::{Location, Record};

/// Where the index reads records from to disambiguate hash collisions
pub trait RecordSource: Send + Sync {
    fn read_record(&self, location: &Location) -> Result<Record>;
}
