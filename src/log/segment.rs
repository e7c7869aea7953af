//! Segment files
//!
//! A [`Segment`] is shared as `Arc<Segment>`: the log's segment table, the
//! active writer, scanners and iteration snapshots each hold a clone. The
//! strong count is the reader reference count; once a segment is doomed by
//! compaction its file is unlinked when the last clone drops.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;

use crate::error::{EmberError, Result};

use super::format::{SegmentHeader, SEGMENT_HEADER_SIZE};
use super::record::{Location, Record};

/// One append-only segment file
#[derive(Debug)]
pub struct Segment {
    id: u64,
    partition: Option<u32>,
    path: PathBuf,
    /// Read handle used for positioned reads
    file: File,
    /// High-water mark: bytes below it are complete frames
    len: AtomicU64,
    sealed: AtomicBool,
    doomed: AtomicBool,
}

impl Segment {
    /// Create a new segment file and return it with its append handle
    pub(crate) fn create(path: &Path, id: u64, partition: Option<u32>) -> Result<(Arc<Self>, File)> {
        let mut writer = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(path)?;
        writer.write_all(&SegmentHeader::current(partition).encode())?;
        writer.sync_all()?;

        let file = File::open(path)?;
        let segment = Arc::new(Self {
            id,
            partition,
            path: path.to_path_buf(),
            file,
            len: AtomicU64::new(SEGMENT_HEADER_SIZE),
            sealed: AtomicBool::new(false),
            doomed: AtomicBool::new(false),
        });
        Ok((segment, writer))
    }

    /// Open an existing segment and validate its header
    pub(crate) fn open(path: &Path, id: u64) -> Result<Self> {
        let mut file = File::open(path)?;
        let file_len = file.metadata()?.len();

        let mut header = [0u8; SEGMENT_HEADER_SIZE as usize];
        file.read_exact(&mut header)?;
        let header = SegmentHeader::decode(id, &header)?;

        Ok(Self {
            id,
            partition: header.partition,
            path: path.to_path_buf(),
            file,
            len: AtomicU64::new(file_len),
            sealed: AtomicBool::new(false),
            doomed: AtomicBool::new(false),
        })
    }

    /// Reopen the file for appending at its current end
    pub(crate) fn append_handle(&self) -> Result<File> {
        Ok(OpenOptions::new().append(true).open(&self.path)?)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn partition(&self) -> Option<u32> {
        self.partition
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current high-water mark
    pub fn len(&self) -> u64 {
        self.len.load(Ordering::Acquire)
    }

    /// True when the segment holds no frames
    pub fn is_empty(&self) -> bool {
        self.len() <= SEGMENT_HEADER_SIZE
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }

    pub(crate) fn set_len(&self, len: u64) {
        self.len.store(len, Ordering::Release);
    }

    pub(crate) fn seal(&self) {
        self.sealed.store(true, Ordering::Release);
    }

    pub(crate) fn doom(&self) {
        self.sealed.store(true, Ordering::Release);
        self.doomed.store(true, Ordering::Release);
    }

    /// Read and validate the frame at `location`
    pub fn read(&self, location: &Location) -> Result<Record> {
        if location.segment != self.id {
            return Err(EmberError::Storage(format!(
                "location for segment {} routed to segment {}",
                location.segment, self.id
            )));
        }
        if location.offset < SEGMENT_HEADER_SIZE || location.end() > self.len() {
            return Err(EmberError::corruption(
                self.id,
                location.offset,
                format!(
                    "frame [{}, {}) lies outside the written range of {} bytes",
                    location.offset,
                    location.end(),
                    self.len()
                ),
            ));
        }

        let mut buf = vec![0u8; location.length as usize];
        read_exact_at(&self.file, &mut buf, location.offset)?;
        Record::decode(Bytes::from(buf), self.id, location.offset)
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        if !self.doomed.load(Ordering::Acquire) {
            return;
        }
        match fs::remove_file(&self.path) {
            Ok(()) => tracing::debug!("Deleted segment {} ({})", self.id, self.path.display()),
            Err(e) => tracing::warn!("Failed to delete segment {}: {}", self.id, e),
        }
    }
}

/// Positioned read that does not move any shared cursor
#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_read(buf, offset) {
            Ok(0) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "failed to fill whole buffer",
                ))
            }
            Ok(n) => {
                buf = &mut buf[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
