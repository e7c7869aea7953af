//! Record frames
//!
//! A [`Record`] is one logged mutation. On disk it is a self-delimiting,
//! checksummed frame:
//!
//! ```text
//! [keyLen u32][valueLen u32][metaLen u32][expiry i64][cacheSegment u32][flags u8]
//! [key][value][meta][crc32 u32]
//! ```
//!
//! All integers are little endian and the CRC covers everything before it.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::clock;
use crate::error::{EmberError, Result};

/// Fixed part of a frame preceding the payload
pub const FRAME_HEADER_SIZE: usize = 25;

/// Trailing checksum
pub const CRC_SIZE: usize = 4;

/// Bytes a frame costs on top of its payload
pub const FRAME_OVERHEAD: usize = FRAME_HEADER_SIZE + CRC_SIZE;

/// Expiry value meaning "never expires"
pub const NO_EXPIRY: i64 = -1;

const FLAG_TOMBSTONE: u8 = 0x01;
const KNOWN_FLAGS: u8 = FLAG_TOMBSTONE;

/// Where a frame lives in the log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    pub segment: u64,
    pub offset: u64,
    pub length: u32,
}

impl Location {
    pub fn end(&self) -> u64 {
        self.offset + self.length as u64
    }
}

/// A single logged mutation (value write or tombstone) for one key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub key: Bytes,
    /// `None` marks a tombstone
    pub value: Option<Bytes>,
    /// Opaque to the store; an empty blob round-trips as `None`
    pub metadata: Option<Bytes>,
    /// Absolute expiry in millis, [`NO_EXPIRY`] for never
    pub expiry: i64,
    pub cache_segment: u32,
}

impl Record {
    pub fn value(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            value: Some(value.into()),
            metadata: None,
            expiry: NO_EXPIRY,
            cache_segment: 0,
        }
    }

    pub fn tombstone(key: impl Into<Bytes>, cache_segment: u32) -> Self {
        Self {
            key: key.into(),
            value: None,
            metadata: None,
            expiry: NO_EXPIRY,
            cache_segment,
        }
    }

    pub fn with_metadata(mut self, metadata: impl Into<Bytes>) -> Self {
        let metadata = metadata.into();
        self.metadata = (!metadata.is_empty()).then_some(metadata);
        self
    }

    pub fn with_expiry(mut self, expiry: i64) -> Self {
        self.expiry = expiry;
        self
    }

    pub fn in_segment(mut self, cache_segment: u32) -> Self {
        self.cache_segment = cache_segment;
        self
    }

    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }

    pub fn is_expired(&self, now: i64) -> bool {
        clock::is_expired(self.expiry, now)
    }

    /// Size of the encoded frame
    pub fn frame_len(&self) -> usize {
        FRAME_OVERHEAD
            + self.key.len()
            + self.value.as_ref().map_or(0, |v| v.len())
            + self.metadata.as_ref().map_or(0, |m| m.len())
    }

    /// Encode into a complete frame (header, payload, checksum)
    pub fn encode(&self) -> Bytes {
        let value = self.value.as_deref().unwrap_or_default();
        let metadata = self.metadata.as_deref().unwrap_or_default();
        let flags = if self.is_tombstone() { FLAG_TOMBSTONE } else { 0 };

        let mut buf = BytesMut::with_capacity(self.frame_len());
        buf.put_u32_le(self.key.len() as u32);
        buf.put_u32_le(value.len() as u32);
        buf.put_u32_le(metadata.len() as u32);
        buf.put_i64_le(self.expiry);
        buf.put_u32_le(self.cache_segment);
        buf.put_u8(flags);
        buf.put_slice(&self.key);
        buf.put_slice(value);
        buf.put_slice(metadata);

        let crc = crc32fast::hash(&buf);
        buf.put_u32_le(crc);
        buf.freeze()
    }

    /// Decode a complete frame read from `segment` at `offset`
    ///
    /// The returned record slices `frame` without copying.
    pub fn decode(frame: Bytes, segment: u64, offset: u64) -> Result<Self> {
        if frame.len() < FRAME_OVERHEAD {
            return Err(EmberError::corruption(
                segment,
                offset,
                format!("frame of {} bytes is shorter than its header", frame.len()),
            ));
        }

        let header = FrameHeader::parse(&frame[..FRAME_HEADER_SIZE]);
        let expected = header.frame_len();
        if expected != frame.len() as u64 {
            return Err(EmberError::corruption(
                segment,
                offset,
                format!("frame length {} does not match header ({})", frame.len(), expected),
            ));
        }

        let body_len = frame.len() - CRC_SIZE;
        let stored_crc = (&frame[body_len..]).get_u32_le();
        let actual_crc = crc32fast::hash(&frame[..body_len]);
        if stored_crc != actual_crc {
            return Err(EmberError::corruption(
                segment,
                offset,
                format!("checksum mismatch: stored {:08x}, computed {:08x}", stored_crc, actual_crc),
            ));
        }

        if header.flags & !KNOWN_FLAGS != 0 {
            return Err(EmberError::corruption(
                segment,
                offset,
                format!("unknown frame flags {:#04x}", header.flags),
            ));
        }
        let tombstone = header.flags & FLAG_TOMBSTONE != 0;
        if tombstone && header.value_len != 0 {
            return Err(EmberError::corruption(
                segment,
                offset,
                "tombstone frame carries a value",
            ));
        }

        let key_start = FRAME_HEADER_SIZE;
        let value_start = key_start + header.key_len as usize;
        let meta_start = value_start + header.value_len as usize;
        let meta_end = meta_start + header.meta_len as usize;

        Ok(Self {
            key: frame.slice(key_start..value_start),
            value: (!tombstone).then(|| frame.slice(value_start..meta_start)),
            metadata: (header.meta_len > 0).then(|| frame.slice(meta_start..meta_end)),
            expiry: header.expiry,
            cache_segment: header.cache_segment,
        })
    }
}

/// Parsed fixed-size frame header
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    pub key_len: u32,
    pub value_len: u32,
    pub meta_len: u32,
    pub expiry: i64,
    pub cache_segment: u32,
    pub flags: u8,
}

impl FrameHeader {
    /// Parse the first [`FRAME_HEADER_SIZE`] bytes of `bytes`
    pub fn parse(mut bytes: &[u8]) -> Self {
        Self {
            key_len: bytes.get_u32_le(),
            value_len: bytes.get_u32_le(),
            meta_len: bytes.get_u32_le(),
            expiry: bytes.get_i64_le(),
            cache_segment: bytes.get_u32_le(),
            flags: bytes.get_u8(),
        }
    }

    /// Total frame size implied by this header
    pub fn frame_len(&self) -> u64 {
        FRAME_OVERHEAD as u64 + self.key_len as u64 + self.value_len as u64 + self.meta_len as u64
    }
}
