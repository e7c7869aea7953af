//! Segment Scanner
//!
//! Sequential iteration over every frame of one segment, oldest first.
//! Used by recovery, compaction and the fallback lookup path.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::sync::Arc;

use bytes::{BufMut, BytesMut};

use crate::error::{EmberError, Result};

use super::format::SEGMENT_HEADER_SIZE;
use super::record::{FrameHeader, Location, Record, FRAME_HEADER_SIZE, FRAME_OVERHEAD};
use super::segment::Segment;

/// Iterator over `(Location, Record)` pairs of a segment
///
/// Holds a handle on the segment, so the file outlives a concurrent
/// `seal_and_delete` until the scanner is dropped. Iteration stops after the
/// first invalid frame, which is yielded as a `Corruption` error carrying the
/// offset where the valid prefix ends.
pub struct SegmentScanner {
    segment: Arc<Segment>,
    reader: BufReader<File>,
    offset: u64,
    end: u64,
    done: bool,
}

impl SegmentScanner {
    pub(crate) fn new(segment: Arc<Segment>) -> Result<Self> {
        let mut file = File::open(segment.path())?;
        file.seek(SeekFrom::Start(SEGMENT_HEADER_SIZE))?;
        let end = segment.len();
        Ok(Self {
            segment,
            reader: BufReader::new(file),
            offset: SEGMENT_HEADER_SIZE,
            end,
            done: false,
        })
    }

    pub fn segment_id(&self) -> u64 {
        self.segment.id()
    }

    /// End of the last frame read successfully
    pub fn valid_end(&self) -> u64 {
        self.offset
    }

    fn read_frame(&mut self) -> Result<(Location, Record)> {
        let id = self.segment.id();
        let remaining = self.end - self.offset;
        if remaining < FRAME_OVERHEAD as u64 {
            return Err(EmberError::corruption(
                id,
                self.offset,
                format!("truncated frame: {} trailing bytes", remaining),
            ));
        }

        let mut header = [0u8; FRAME_HEADER_SIZE];
        self.reader.read_exact(&mut header)?;
        let frame_len = FrameHeader::parse(&header).frame_len();
        if frame_len > remaining {
            return Err(EmberError::corruption(
                id,
                self.offset,
                format!(
                    "frame of {} bytes extends past the end of the segment ({} left)",
                    frame_len, remaining
                ),
            ));
        }

        let mut frame = BytesMut::with_capacity(frame_len as usize);
        frame.put_slice(&header);
        frame.resize(frame_len as usize, 0);
        self.reader.read_exact(&mut frame[FRAME_HEADER_SIZE..])?;

        let record = Record::decode(frame.freeze(), id, self.offset)?;
        let location = Location {
            segment: id,
            offset: self.offset,
            length: frame_len as u32,
        };
        self.offset += frame_len;
        Ok((location, record))
    }
}

impl Iterator for SegmentScanner {
    type Item = Result<(Location, Record)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.offset >= self.end {
            return None;
        }
        let item = self.read_frame();
        if item.is_err() {
            self.done = true;
        }
        Some(item)
    }
}
