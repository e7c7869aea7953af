//! Segment file header and format versions
//!
//! ```text
//! ┌──────────┬─────────────┬───────────┬───────────────┬──────────────┐
//! │Magic (4) │ Version (2) │ Flags (2) │ Partition (4) │ Reserved (4) │
//! └──────────┴─────────────┴───────────┴───────────────┴──────────────┘
//! ```

use bytes::{Buf, BufMut};

use crate::error::{EmberError, Result};

/// Magic bytes identifying an emberkv segment file
pub const MAGIC: &[u8; 4] = b"EMKV";

/// Header size: Magic (4) + Version (2) + Flags (2) + Partition (4) + Reserved (4)
pub const SEGMENT_HEADER_SIZE: u64 = 16;

const FLAG_PARTITIONED: u16 = 0x0001;

/// On-disk layouts this build knows about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum FormatVersion {
    /// Frames without metadata length or cache segment id
    V1 = 1,
    /// Current layout
    V2 = 2,
}

impl FormatVersion {
    pub const CURRENT: FormatVersion = FormatVersion::V2;

    pub fn from_u16(raw: u16) -> Option<Self> {
        match raw {
            1 => Some(FormatVersion::V1),
            2 => Some(FormatVersion::V2),
            _ => None,
        }
    }

    /// Accept or reject a segment written with this version
    pub fn ensure_readable(self, segment: u64) -> Result<()> {
        match self {
            FormatVersion::V2 => Ok(()),
            FormatVersion::V1 => Err(EmberError::IncompatibleFormat {
                segment,
                reason: "format v1 frames carry no cache segment id; \
                         export and re-import the data to upgrade"
                    .to_string(),
            }),
        }
    }
}

/// Decoded segment header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    pub version: FormatVersion,
    pub partition: Option<u32>,
}

impl SegmentHeader {
    pub fn current(partition: Option<u32>) -> Self {
        Self {
            version: FormatVersion::CURRENT,
            partition,
        }
    }

    pub fn encode(&self) -> [u8; SEGMENT_HEADER_SIZE as usize] {
        let mut out = [0u8; SEGMENT_HEADER_SIZE as usize];
        let mut buf = &mut out[..];
        buf.put_slice(MAGIC);
        buf.put_u16_le(self.version as u16);
        buf.put_u16_le(if self.partition.is_some() { FLAG_PARTITIONED } else { 0 });
        buf.put_u32_le(self.partition.unwrap_or(0));
        buf.put_u32_le(0);
        out
    }

    /// Parse and version-check the header of segment `segment`
    pub fn decode(segment: u64, bytes: &[u8; SEGMENT_HEADER_SIZE as usize]) -> Result<Self> {
        if &bytes[0..4] != MAGIC {
            return Err(EmberError::IncompatibleFormat {
                segment,
                reason: format!(
                    "expected magic EMKV, got {:?}; unversioned layouts are not supported",
                    &bytes[0..4]
                ),
            });
        }

        let mut buf = &bytes[4..];
        let raw_version = buf.get_u16_le();
        let flags = buf.get_u16_le();
        let partition = buf.get_u32_le();

        let version = FormatVersion::from_u16(raw_version).ok_or_else(|| {
            EmberError::IncompatibleFormat {
                segment,
                reason: format!("unknown format version {}", raw_version),
            }
        })?;
        version.ensure_readable(segment)?;

        Ok(Self {
            version,
            partition: (flags & FLAG_PARTITIONED != 0).then_some(partition),
        })
    }
}
