//! # emberkv
//!
//! An embedded, durable key-value storage engine for the persistence tier of
//! an in-memory cache:
//! - Append-only, checksummed segment log
//! - Paged soft index with a bounded LRU of resident pages
//! - Single-writer commit order, many concurrent readers
//! - Crash recovery (checkpoint reload or full log replay)
//! - Background compaction that never blocks service
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        StoreEngine                          │
//! │     write / delete / load / iterate / size / clear          │
//! └───────┬──────────────────────────────┬──────────────────────┘
//!         │ mutations                    │ reads
//!         ▼                              │
//! ┌──────────────────┐                   │
//! │ WriteCoordinator │◄───── Compactor   │
//! │ (one thread)     │  (relocations)    │
//! └───────┬──────────┘                   │
//!         │ append, then index update    │
//!         ▼                              ▼
//!   ┌─────────────┐              ┌──────────────┐
//!   │ LogManager  │◄─────────────│ IndexManager │
//!   │ (segments)  │  verify keys │ (soft index) │
//!   └─────────────┘              └──────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod clock;
pub mod config;
pub mod error;

pub mod compaction;
pub mod engine;
pub mod index;
pub mod log;
pub mod recovery;
pub mod writer;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use clock::{ControlledTimeService, SystemTimeService, TimeService};
pub use compaction::CompactionReport;
pub use config::{Config, SyncStrategy};
pub use engine::{Entry, EntryStream, IterateOptions, Metadata, PublishedEntry, StoreEngine};
pub use error::{EmberError, Result};
pub use recovery::{RecoveryReport, RecoveryState};
pub use writer::BatchOp;

// =============================================================================
// Version Info
// =============================================================================

/// Current version of emberkv
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
