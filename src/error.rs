//! Error types for emberkv
//!
//! Provides a unified error type for all operations. "Not found" is never an
//! error: lookups return `Ok(None)` for absent keys and reserve `Err` for
//! conditions that would otherwise lose or corrupt data.

use thiserror::Error;

/// Result type alias using EmberError
pub type Result<T> = std::result::Result<T, EmberError>;

/// Unified error type for emberkv operations
#[derive(Debug, Error)]
pub enum EmberError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Log Errors
    // -------------------------------------------------------------------------
    #[error("Corruption in segment {segment} at offset {offset}: {reason}")]
    Corruption {
        segment: u64,
        offset: u64,
        reason: String,
    },

    #[error("Incompatible on-disk format in segment {segment}: {reason}")]
    IncompatibleFormat { segment: u64, reason: String },

    #[error("Segment {0} not found")]
    SegmentNotFound(u64),

    // -------------------------------------------------------------------------
    // Index Errors
    // -------------------------------------------------------------------------
    #[error("Index corruption: {0}")]
    IndexCorruption(String),

    // -------------------------------------------------------------------------
    // Serialization Errors
    // -------------------------------------------------------------------------
    #[error("Serialization error: {0}")]
    Serialization(String),

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),

    // -------------------------------------------------------------------------
    // Lifecycle Errors
    // -------------------------------------------------------------------------
    #[error("Recovery failed: {0}")]
    RecoveryFailed(#[source] Box<EmberError>),

    #[error("Store is not running")]
    NotRunning,

    #[error("Store is shutting down")]
    ShuttingDown,

    #[error("Storage error: {0}")]
    Storage(String),
}

impl EmberError {
    /// True for checksum mismatches and malformed frames
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            EmberError::Corruption { .. } | EmberError::IndexCorruption(_)
        )
    }

    pub(crate) fn corruption(segment: u64, offset: u64, reason: impl Into<String>) -> Self {
        EmberError::Corruption {
            segment,
            offset,
            reason: reason.into(),
        }
    }
}

impl From<bincode::Error> for EmberError {
    fn from(e: bincode::Error) -> Self {
        EmberError::Serialization(e.to_string())
    }
}
