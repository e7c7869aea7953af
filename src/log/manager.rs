//! Log Manager
//!
//! Owns the segment files and coordinates appends and reads.
//!
//! ## Responsibilities
//! - Discover existing segments on startup and validate their headers
//! - Append frames to the active segment, rotating at `max_file_size`
//! - Positioned reads by [`Location`]
//! - Seal and delete segments once compaction has emptied them

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::config::{Config, SyncStrategy};
use crate::error::{EmberError, Result};
use crate::index::RecordSource;

use super::format::SEGMENT_HEADER_SIZE;
use super::record::{Location, Record};
use super::scanner::SegmentScanner;
use super::segment::Segment;

/// Options the log needs from [`Config`]
#[derive(Debug, Clone, Copy)]
pub struct LogOptions {
    pub max_file_size: u64,
    /// Partition count in segmented mode
    pub partitions: Option<u32>,
    pub sync_strategy: SyncStrategy,
}

impl From<&Config> for LogOptions {
    fn from(config: &Config) -> Self {
        Self {
            max_file_size: config.max_file_size,
            partitions: config.partitions(),
            sync_strategy: config.sync_strategy,
        }
    }
}

/// Size and placement of one segment, as recorded by index checkpoints
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentState {
    pub id: u64,
    pub partition: Option<u32>,
    pub len: u64,
}

/// Snapshot of the whole log, ordered by segment id
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogState {
    pub segments: Vec<SegmentState>,
}

/// The segment currently accepting appends for one partition
struct ActiveSegment {
    segment: Arc<Segment>,
    file: File,
    unsynced: usize,
}

/// Manages the segment files
///
/// ## Concurrency:
/// - `segments`: RwLock, readers clone an `Arc<Segment>` and release the lock
///   before doing I/O
/// - `active`: Mutex, only the writer thread appends; compaction and
///   shutdown take it to sync or seal
/// - Lock order is always `active` → `segments`
pub struct LogManager {
    dir: PathBuf,
    options: LogOptions,
    segments: RwLock<BTreeMap<u64, Arc<Segment>>>,
    active: Mutex<HashMap<Option<u32>, ActiveSegment>>,
    next_id: AtomicU64,
    seal_listeners: Mutex<Vec<Sender<u64>>>,
}

impl LogManager {
    /// Open or create the log in `dir`
    ///
    /// On startup:
    /// 1. Discover `segment_NNNNNN.log` files
    /// 2. Validate every header (incompatible formats are rejected)
    /// 3. Reopen the newest segment of each partition for appending
    /// 4. Seal everything else
    pub fn open(dir: &Path, options: LogOptions) -> Result<Self> {
        fs::create_dir_all(dir)?;

        let mut ids: Vec<u64> = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_file() {
                if let Some(id) = Self::parse_segment_id(&path) {
                    ids.push(id);
                }
            }
        }
        ids.sort_unstable();

        let mut segments = BTreeMap::new();
        for id in &ids {
            let path = Self::segment_path_with_dir(dir, *id);
            if fs::metadata(&path)?.len() < SEGMENT_HEADER_SIZE {
                tracing::warn!("Removing segment {} with an incomplete header", id);
                fs::remove_file(&path)?;
                continue;
            }
            let segment = Segment::open(&path, *id)?;
            Self::check_partition(&options, &segment)?;
            segments.insert(*id, Arc::new(segment));
        }

        // Newest segment per partition stays writable unless already full
        let mut newest: HashMap<Option<u32>, Arc<Segment>> = HashMap::new();
        for segment in segments.values() {
            if let Some(previous) = newest.insert(segment.partition(), Arc::clone(segment)) {
                previous.seal();
            }
        }

        let mut active = HashMap::new();
        for (partition, segment) in newest {
            if segment.len() >= options.max_file_size {
                segment.seal();
                continue;
            }
            let file = segment.append_handle()?;
            active.insert(
                partition,
                ActiveSegment {
                    segment,
                    file,
                    unsynced: 0,
                },
            );
        }

        let next_id = ids.last().map(|&id| id + 1).unwrap_or(1);
        tracing::debug!(
            "Opened log at {} with {} segments (next id {})",
            dir.display(),
            segments.len(),
            next_id
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            options,
            segments: RwLock::new(segments),
            active: Mutex::new(active),
            next_id: AtomicU64::new(next_id),
            seal_listeners: Mutex::new(Vec::new()),
        })
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Append a record and return where it landed
    ///
    /// Starts a new segment first if the frame would push the active one past
    /// `max_file_size`. A failed write is cut back off the file so no partial
    /// frame is left behind.
    pub fn append(&self, record: &Record) -> Result<Location> {
        let partition = self.partition_for(record.cache_segment);
        let frame = record.encode();
        let frame_len = frame.len() as u64;

        let mut active = self.active.lock();
        let slot = match active.entry(partition) {
            Entry::Occupied(mut occupied) => {
                let current = occupied.get().segment.len();
                if current + frame_len > self.options.max_file_size && current > SEGMENT_HEADER_SIZE {
                    let fresh = self.create_segment(partition)?;
                    let old = occupied.insert(fresh);
                    self.seal_active(old)?;
                }
                occupied.into_mut()
            }
            Entry::Vacant(vacant) => vacant.insert(self.create_segment(partition)?),
        };

        let offset = slot.segment.len();
        if let Err(e) = Self::write_frame(slot, &frame, self.options.sync_strategy) {
            if let Err(undo) = slot.file.set_len(offset) {
                tracing::error!(
                    "Failed to cut partial frame from segment {}: {}",
                    slot.segment.id(),
                    undo
                );
            }
            return Err(e);
        }
        slot.segment.set_len(offset + frame_len);

        Ok(Location {
            segment: slot.segment.id(),
            offset,
            length: frame_len as u32,
        })
    }

    fn write_frame(slot: &mut ActiveSegment, frame: &[u8], strategy: SyncStrategy) -> Result<()> {
        use std::io::Write;

        slot.file.write_all(frame)?;
        slot.unsynced += 1;
        let sync_now = match strategy {
            SyncStrategy::EveryWrite => true,
            SyncStrategy::EveryNEntries { count } => slot.unsynced >= count,
        };
        if sync_now {
            slot.file.sync_data()?;
            slot.unsynced = 0;
        }
        Ok(())
    }

    /// Undo the most recent append, which must still be the tail of its segment
    pub fn rollback(&self, location: &Location) -> Result<()> {
        let mut active = self.active.lock();
        let slot = active
            .values_mut()
            .find(|slot| slot.segment.id() == location.segment)
            .ok_or_else(|| {
                EmberError::Storage(format!(
                    "cannot roll back {:?}: segment is no longer active",
                    location
                ))
            })?;
        if slot.segment.len() != location.end() {
            return Err(EmberError::Storage(format!(
                "cannot roll back {:?}: it is not the tail of segment {}",
                location,
                slot.segment.id()
            )));
        }
        slot.file.set_len(location.offset)?;
        slot.file.sync_data()?;
        slot.segment.set_len(location.offset);
        Ok(())
    }

    /// Seal every active segment that reached `max_file_size`
    pub fn rotate_if_full(&self) -> Result<Vec<u64>> {
        let mut active = self.active.lock();
        let full: Vec<Option<u32>> = active
            .iter()
            .filter(|(_, slot)| slot.segment.len() >= self.options.max_file_size)
            .map(|(partition, _)| *partition)
            .collect();

        let mut sealed = Vec::with_capacity(full.len());
        for partition in full {
            if let Some(slot) = active.remove(&partition) {
                sealed.push(slot.segment.id());
                self.seal_active(slot)?;
            }
        }
        Ok(sealed)
    }

    /// fsync every active segment
    pub fn sync(&self) -> Result<()> {
        let mut active = self.active.lock();
        for slot in active.values_mut() {
            if slot.unsynced > 0 {
                slot.file.sync_data()?;
                slot.unsynced = 0;
            }
        }
        Ok(())
    }

    /// Remove a sealed segment from the log
    ///
    /// The file itself is unlinked when the last outstanding handle (reader,
    /// scanner or iteration snapshot) is released. Returns `false` if the
    /// segment was already gone.
    pub fn seal_and_delete(&self, id: u64) -> Result<bool> {
        let segment = {
            let mut segments = self.segments.write();
            match segments.get(&id) {
                None => return Ok(false),
                Some(segment) if !segment.is_sealed() => {
                    return Err(EmberError::Storage(format!(
                        "segment {} is still active and cannot be deleted",
                        id
                    )))
                }
                Some(_) => {}
            }
            segments.remove(&id)
        };

        if let Some(segment) = segment {
            segment.doom();
            let holders = Arc::strong_count(&segment) - 1;
            if holders > 0 {
                tracing::debug!(
                    "Deletion of segment {} deferred until {} handle(s) are released",
                    id,
                    holders
                );
            }
        }
        Ok(true)
    }

    /// Drop a torn tail: cut segment `id` back to `len` bytes
    pub fn truncate(&self, id: u64, len: u64) -> Result<u64> {
        let mut active = self.active.lock();
        let segment = self.pin(id).ok_or(EmberError::SegmentNotFound(id))?;
        let removed = segment.len().saturating_sub(len);
        if removed == 0 {
            return Ok(0);
        }

        match active.values_mut().find(|slot| slot.segment.id() == id) {
            Some(slot) => {
                slot.file.set_len(len)?;
                slot.file.sync_data()?;
            }
            None => {
                let file = OpenOptions::new().write(true).open(segment.path())?;
                file.set_len(len)?;
                file.sync_data()?;
            }
        }
        segment.set_len(len);
        tracing::warn!("Truncated {} bytes from the tail of segment {}", removed, id);
        Ok(removed)
    }

    /// Delete every segment; new ids keep increasing
    pub fn clear(&self) -> Result<()> {
        let mut active = self.active.lock();
        active.clear();
        let mut segments = self.segments.write();
        for (_, segment) in std::mem::take(&mut *segments) {
            segment.doom();
        }
        Ok(())
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Read the record stored at `location`
    pub fn read(&self, location: &Location) -> Result<Record> {
        let segment = self
            .pin(location.segment)
            .ok_or(EmberError::SegmentNotFound(location.segment))?;
        segment.read(location)
    }

    /// Pin a segment: its file stays readable while the handle is held
    pub fn pin(&self, id: u64) -> Option<Arc<Segment>> {
        self.segments.read().get(&id).cloned()
    }

    /// Scan all frames of segment `id`
    pub fn scan(&self, id: u64) -> Result<SegmentScanner> {
        let segment = self.pin(id).ok_or(EmberError::SegmentNotFound(id))?;
        SegmentScanner::new(segment)
    }

    /// Find the latest record for `key` by scanning every segment
    ///
    /// Only used while the index is being rebuilt. An invalid tail on the
    /// newest segment of a partition ends that segment's scan.
    pub fn find_latest(&self, key: &[u8]) -> Result<Option<Record>> {
        let mut latest = None;
        for id in self.list_segments() {
            let scanner = match self.scan(id) {
                Ok(scanner) => scanner,
                Err(EmberError::SegmentNotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            for item in scanner {
                match item {
                    Ok((_, record)) if record.key.as_ref() == key => latest = Some(record),
                    Ok(_) => {}
                    Err(e) if e.is_corruption() && self.is_newest_in_partition(id) => break,
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(latest.filter(|record: &Record| !record.is_tombstone()))
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    /// Segment ids, oldest first
    pub fn list_segments(&self) -> Vec<u64> {
        self.segments.read().keys().copied().collect()
    }

    /// Segment ids of one partition, oldest first
    pub fn list_segments_for(&self, partition: Option<u32>) -> Vec<u64> {
        self.segments
            .read()
            .values()
            .filter(|segment| segment.partition() == partition)
            .map(|segment| segment.id())
            .collect()
    }

    pub fn is_sealed(&self, id: u64) -> bool {
        self.pin(id).map_or(false, |segment| segment.is_sealed())
    }

    /// True if no older segment shares the partition of `id`
    pub fn is_oldest_in_partition(&self, id: u64) -> bool {
        let segments = self.segments.read();
        let Some(segment) = segments.get(&id) else {
            return false;
        };
        let partition = segment.partition();
        !segments
            .range(..id)
            .any(|(_, other)| other.partition() == partition)
    }

    /// True if no newer segment shares the partition of `id`
    pub fn is_newest_in_partition(&self, id: u64) -> bool {
        let segments = self.segments.read();
        let Some(segment) = segments.get(&id) else {
            return false;
        };
        let partition = segment.partition();
        !segments
            .range(id + 1..)
            .any(|(_, other)| other.partition() == partition)
    }

    /// Ids and lengths of all segments, for checkpoint staleness checks
    pub fn log_state(&self) -> LogState {
        let segments = self.segments.read();
        LogState {
            segments: segments
                .values()
                .map(|segment| SegmentState {
                    id: segment.id(),
                    partition: segment.partition(),
                    len: segment.len(),
                })
                .collect(),
        }
    }

    /// Total bytes across all segment files
    pub fn disk_usage(&self) -> u64 {
        self.segments.read().values().map(|segment| segment.len()).sum()
    }

    /// Receive the id of every segment sealed by rotation from now on
    pub fn subscribe_seals(&self) -> Receiver<u64> {
        let (tx, rx) = channel::unbounded();
        self.seal_listeners.lock().push(tx);
        rx
    }

    /// Partition a cache segment's records are written to
    pub fn partition_for(&self, cache_segment: u32) -> Option<u32> {
        self.options.partitions.map(|count| cache_segment % count)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn next_segment_id(&self) -> u64 {
        self.next_id.load(Ordering::SeqCst)
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn create_segment(&self, partition: Option<u32>) -> Result<ActiveSegment> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let path = self.segment_path(id);
        let (segment, file) = Segment::create(&path, id, partition)?;
        self.segments.write().insert(id, Arc::clone(&segment));
        tracing::debug!("Started segment {} (partition {:?})", id, partition);
        Ok(ActiveSegment {
            segment,
            file,
            unsynced: 0,
        })
    }

    fn seal_active(&self, mut slot: ActiveSegment) -> Result<()> {
        slot.file.sync_all()?;
        slot.unsynced = 0;
        slot.segment.seal();
        let id = slot.segment.id();
        tracing::debug!("Sealed segment {} at {} bytes", id, slot.segment.len());
        self.seal_listeners
            .lock()
            .retain(|listener| listener.send(id).is_ok());
        Ok(())
    }

    fn check_partition(options: &LogOptions, segment: &Segment) -> Result<()> {
        match (options.partitions, segment.partition()) {
            (None, None) => Ok(()),
            (Some(count), Some(partition)) if partition < count => Ok(()),
            (Some(count), Some(partition)) => Err(EmberError::Config(format!(
                "segment {} belongs to partition {} but only {} cache segments are configured",
                segment.id(),
                partition,
                count
            ))),
            (Some(_), None) => Err(EmberError::Config(format!(
                "segment {} was written without segmentation; disable `segmented` or purge",
                segment.id()
            ))),
            (None, Some(_)) => Err(EmberError::Config(format!(
                "segment {} was written in segmented mode; enable `segmented` or purge",
                segment.id()
            ))),
        }
    }

    /// Generate the file path for a segment with given ID
    fn segment_path(&self, id: u64) -> PathBuf {
        Self::segment_path_with_dir(&self.dir, id)
    }

    /// Generate segment path given a directory and ID
    fn segment_path_with_dir(dir: &Path, id: u64) -> PathBuf {
        dir.join(format!("segment_{:06}.log", id))
    }

    /// Parse segment ID from filename
    /// "segment_000042.log" → Some(42)
    fn parse_segment_id(path: &Path) -> Option<u64> {
        if path.extension()? != "log" {
            return None;
        }
        let name = path.file_stem()?.to_string_lossy();
        let id_str = name.strip_prefix("segment_")?;
        id_str.parse().ok()
    }
}

impl RecordSource for LogManager {
    fn read_record(&self, location: &Location) -> Result<Record> {
        self.read(location)
    }
}
