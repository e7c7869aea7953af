//! Index checkpoint manifest
//!
//! Written after every dirty page has been flushed. It records the exact log
//! state the pages describe; on startup the index is trusted only if the log
//! still looks exactly like that.
//!
//! ```text
//! index.chk = [crc32 u32][bincode(IndexCheckpoint)]
//! ```

use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::compaction::SegmentUsage;
use crate::error::{EmberError, Result};
use crate::log::LogState;

pub const CHECKPOINT_FILE: &str = "index.chk";
pub const CHECKPOINT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexCheckpoint {
    pub version: u32,
    pub page_count: u32,
    pub entry_count: u64,
    pub log_state: LogState,
    pub usage: Vec<(u64, SegmentUsage)>,
}

impl IndexCheckpoint {
    /// Persist atomically (tmp + rename + fsync)
    pub fn write(&self, dir: &Path) -> Result<()> {
        let body = bincode::serialize(self)?;
        let mut out = Vec::with_capacity(4 + body.len());
        out.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
        out.extend_from_slice(&body);

        let path = dir.join(CHECKPOINT_FILE);
        let tmp = path.with_extension("tmp");
        {
            use std::io::Write;
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&out)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Read the manifest; `Ok(None)` if there is none
    pub fn read(dir: &Path) -> Result<Option<Self>> {
        let bytes = match fs::read(dir.join(CHECKPOINT_FILE)) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if bytes.len() < 4 {
            return Err(EmberError::IndexCorruption(
                "checkpoint is truncated".to_string(),
            ));
        }
        let (crc, body) = bytes.split_at(4);
        let stored = u32::from_le_bytes([crc[0], crc[1], crc[2], crc[3]]);
        if stored != crc32fast::hash(body) {
            return Err(EmberError::IndexCorruption(
                "checkpoint failed its checksum".to_string(),
            ));
        }
        bincode::deserialize(body)
            .map(Some)
            .map_err(|e| EmberError::IndexCorruption(format!("checkpoint: {}", e)))
    }

    pub fn remove(dir: &Path) -> Result<()> {
        match fs::remove_file(dir.join(CHECKPOINT_FILE)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
