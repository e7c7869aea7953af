//! Log Module
//!
//! Append-only segment files holding every mutation as a checksummed frame.
//!
//! ## Responsibilities
//! - Append records and hand back their [`Location`]
//! - Positioned, checksum-validated reads
//! - Segment rotation at `max_file_size`, optionally one active file per
//!   cache-segment partition
//! - Deferred deletion of compacted segments (reference counted handles)
//!
//! ## File Format
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │ Header (16 bytes)                                           │
//! │   Magic "EMKV" | Version u16 | Flags u16 | Partition | Rsvd │
//! ├─────────────────────────────────────────────────────────────┤
//! │ Frame 1                                                     │
//! │ ┌──────────────────────────────┬────────────────┬─────────┐ │
//! │ │ KeyLen ValLen MetaLen Expiry │ Key Value Meta │ CRC32   │ │
//! │ │ CacheSegment Flags (25)      │                │ (4)     │ │
//! │ └──────────────────────────────┴────────────────┴─────────┘ │
//! ├─────────────────────────────────────────────────────────────┤
//! │ Frame 2 ...                                                 │
//! └─────────────────────────────────────────────────────────────┘
//! ```

mod format;
mod manager;
mod record;
mod scanner;
mod segment;

pub use format::{FormatVersion, SegmentHeader, MAGIC, SEGMENT_HEADER_SIZE};
pub use manager::{LogManager, LogOptions, LogState, SegmentState};
pub use record::{
    FrameHeader, Location, Record, CRC_SIZE, FRAME_HEADER_SIZE, FRAME_OVERHEAD, NO_EXPIRY,
};
pub use scanner::SegmentScanner;
pub use segment::Segment;
