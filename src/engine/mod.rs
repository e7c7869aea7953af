//! Engine Module
//!
//! The store facade that wires the components together.
//!
//! ## Responsibilities
//! - Start components in order (log → index/recovery → writer → compactor)
//!   and stop them in reverse
//! - Route mutations through the write coordinator
//! - Serve loads straight from the index and log, concurrently with writes
//! - Snapshot iteration and sizing
//!
//! ## Concurrency Model: Single Writer / Many Readers
//!
//! - **Writes** (write/delete/batch/clear) block until the writer thread has
//!   appended to the log and updated the index
//! - **Loads** never wait on the writer: index lookup, then one positioned
//!   read. A read that races with compaction deleting its segment is retried
//!   against the index
//! - **Iteration** walks a pinned snapshot of the index

mod entry;
mod stream;

pub use entry::{Entry, IterateOptions, KeyFilter, Metadata, PublishedEntry};
pub use stream::EntryStream;

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};

use crate::clock::{SystemTimeService, TimeService};
use crate::compaction::{CompactionReport, Compactor, CompactorHandle, UsageTracker};
use crate::config::Config;
use crate::error::{EmberError, Result};
use crate::index::{IndexEntry, IndexManager, IndexStats, RecordSource};
use crate::log::{LogManager, LogOptions};
use crate::recovery::{RecoveryCoordinator, RecoveryReport, RecoveryStatus};
use crate::writer::{Applier, BatchOp, Mutation, Outcome, StartupTask, WriteCoordinator};

/// Attempts for a read that keeps landing on segments compaction just removed
const READ_RETRIES: usize = 8;

/// Components of a started store
struct Running {
    log: Arc<LogManager>,
    index: Arc<IndexManager>,
    writer: Arc<WriteCoordinator>,
    compactor: Arc<Compactor>,
    compactor_thread: Mutex<Option<CompactorHandle>>,
    recovery: Arc<RecoveryStatus>,
}

/// The storage engine
pub struct StoreEngine {
    config: Config,
    clock: Arc<dyn TimeService>,
    running: RwLock<Option<Arc<Running>>>,
}

impl StoreEngine {
    /// Create a stopped engine using the system clock
    pub fn new(config: Config) -> Self {
        Self::with_time_service(config, Arc::new(SystemTimeService))
    }

    /// Create a stopped engine reading time from `clock`
    pub fn with_time_service(config: Config, clock: Arc<dyn TimeService>) -> Self {
        Self {
            config,
            clock,
            running: RwLock::new(None),
        }
    }

    /// Create and start an engine
    pub fn open(config: Config) -> Result<Self> {
        let engine = Self::new(config);
        engine.start()?;
        Ok(engine)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Start the store
    ///
    /// On startup:
    /// 1. Validate config, purge if requested, create directories
    /// 2. Open the log (validates every segment header)
    /// 3. Load the index checkpoint or rebuild from the log (on the writer
    ///    thread when `rebuild_in_background` is set)
    /// 4. Start the writer, then the compactor
    pub fn start(&self) -> Result<()> {
        let mut running = self.running.write();
        if running.is_some() {
            return Ok(());
        }

        let config = &self.config;
        config.validate()?;
        if config.purge_on_startup {
            Self::purge_locations(config)?;
        }
        for dir in [&config.data_location, &config.index_location] {
            fs::create_dir_all(dir).map_err(|e| {
                EmberError::Config(format!("cannot create {}: {}", dir.display(), e))
            })?;
        }

        let log = Arc::new(LogManager::open(&config.data_location, LogOptions::from(config))?);
        let source: Arc<dyn RecordSource> = log.clone();
        let index = Arc::new(IndexManager::open(
            &config.index_location,
            config.index_pages,
            config.index_cache_pages,
            source,
        )?);
        let usage = Arc::new(UsageTracker::new());
        let coordinator =
            RecoveryCoordinator::new(Arc::clone(&log), Arc::clone(&index), Arc::clone(&usage));

        let (recovery, startup) = if config.rebuild_in_background {
            let status = Arc::new(RecoveryStatus::rebuilding());
            let task_status = Arc::clone(&status);
            let task: StartupTask = Box::new(move || {
                let result = coordinator.run();
                task_status.complete(&result);
                result.map(|_| ())
            });
            (status, Some(task))
        } else {
            let report = coordinator.run()?;
            (Arc::new(RecoveryStatus::finished(report)), None)
        };

        let applier = Applier::new(
            Arc::clone(&log),
            Arc::clone(&index),
            Arc::clone(&usage),
            Arc::clone(&self.clock),
            config.index_checkpoint_interval,
        );
        let writer = Arc::new(WriteCoordinator::start(
            applier,
            config.write_queue_capacity,
            startup,
        )?);

        let compactor = Arc::new(Compactor::new(
            Arc::clone(&log),
            Arc::clone(&index),
            usage,
            Arc::clone(&writer),
            Arc::clone(&self.clock),
            Arc::clone(&recovery),
            config.compaction_threshold,
        ));
        let compactor_thread = if config.compaction_enabled {
            Some(CompactorHandle::spawn(
                Arc::clone(&compactor),
                Duration::from_millis(config.compaction_interval_ms),
                log.subscribe_seals(),
            )?)
        } else {
            None
        };

        if config.preload && !recovery.is_rebuilding() {
            let pages = index.warm()?;
            tracing::debug!("Preloaded {} index pages", pages);
        }

        tracing::info!(
            "Store started at {} ({} segments, {} entries)",
            config.data_location.display(),
            log.list_segments().len(),
            index.len()
        );

        *running = Some(Arc::new(Running {
            log,
            index,
            writer,
            compactor,
            compactor_thread: Mutex::new(compactor_thread),
            recovery,
        }));
        Ok(())
    }

    /// Stop the store: compactor first, then drain the writer and take the
    /// final checkpoint
    pub fn stop(&self) -> Result<()> {
        let Some(running) = self.running.write().take() else {
            return Ok(());
        };
        if let Some(mut handle) = running.compactor_thread.lock().take() {
            handle.stop();
        }
        running.writer.stop()?;
        tracing::info!("Store stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.read().is_some()
    }

    /// Delete all on-disk state; only allowed while stopped
    pub fn purge(&self) -> Result<()> {
        if self.is_running() {
            return Err(EmberError::Storage(
                "purge requires a stopped store".to_string(),
            ));
        }
        Self::purge_locations(&self.config)
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Store an entry; returns once it is durable and visible to loads
    pub fn write(&self, entry: Entry) -> Result<()> {
        self.submit(Mutation::Write(entry.into()))?;
        Ok(())
    }

    /// Delete a key; `false` if there was nothing live to delete
    ///
    /// The tombstone is filed under the cache segment of the stored record;
    /// `cache_segment` only matters to callers that track it themselves.
    pub fn delete(&self, key: impl Into<Bytes>, cache_segment: u32) -> Result<bool> {
        match self.submit(Mutation::Delete {
            key: key.into(),
            cache_segment,
        })? {
            Outcome::Removed(removed) => Ok(removed),
            other => Err(Self::unexpected(other)),
        }
    }

    /// Apply writes and deletes in order; returns how many changed something
    pub fn batch(&self, ops: Vec<BatchOp>) -> Result<usize> {
        match self.submit(Mutation::Batch(ops))? {
            Outcome::Batched(changed) => Ok(changed),
            other => Err(Self::unexpected(other)),
        }
    }

    /// Remove every entry
    pub fn clear(&self) -> Result<()> {
        self.submit(Mutation::Clear)?;
        Ok(())
    }

    /// Flush the index and write a checkpoint now
    pub fn checkpoint(&self) -> Result<()> {
        self.submit(Mutation::Checkpoint)?;
        Ok(())
    }

    /// Remove every expired entry; returns how many were removed
    pub fn purge_expired(&self) -> Result<usize> {
        let running = self.running()?;
        running.recovery.wait()?;
        let now = self.clock.wall_clock_millis();

        let mut removed = 0;
        for entry in running.index.snapshot()? {
            if !entry.is_expired(now) {
                continue;
            }
            let Some(key) = Self::key_at(&running, &entry)? else {
                continue;
            };
            let mutation = Mutation::Expire {
                key,
                cache_segment: entry.cache_segment,
                from: entry.location,
            };
            if let Outcome::Removed(true) = running.writer.submit(mutation)? {
                removed += 1;
            }
        }
        tracing::debug!("Purged {} expired entries", removed);
        Ok(removed)
    }

    /// Delete every entry belonging to the given cache segments
    pub fn remove_segments(&self, segments: &HashSet<u32>) -> Result<usize> {
        let running = self.running()?;
        running.recovery.wait()?;

        let mut removed = 0;
        for entry in running.index.snapshot()? {
            if !segments.contains(&entry.cache_segment) {
                continue;
            }
            let Some(key) = Self::key_at(&running, &entry)? else {
                continue;
            };
            let mutation = Mutation::Delete {
                key,
                cache_segment: entry.cache_segment,
            };
            if let Outcome::Removed(true) = running.writer.submit(mutation)? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Value for `key`, if present and not expired
    pub fn load(&self, key: &[u8]) -> Result<Option<Bytes>> {
        Ok(self.load_entry(key)?.map(|entry| entry.value))
    }

    /// Value, metadata and expiry for `key`, if present and not expired
    pub fn load_entry(&self, key: &[u8]) -> Result<Option<Entry>> {
        let running = self.running()?;
        let now = self.clock.wall_clock_millis();

        if !running.recovery.ready()? {
            let record = running.log.find_latest(key)?;
            return Ok(record
                .filter(|record| !record.is_expired(now))
                .and_then(Entry::from_record));
        }

        for _ in 0..READ_RETRIES {
            match running.index.locate(key) {
                Ok(Some((entry, record))) => {
                    if entry.is_expired(now) {
                        return Ok(None);
                    }
                    return Ok(Entry::from_record(record));
                }
                Ok(None) => return Ok(None),
                Err(EmberError::SegmentNotFound(id)) => {
                    tracing::trace!("Segment {} went away during a load, retrying", id);
                }
                Err(e) => return Err(e),
            }
        }
        Err(EmberError::Storage(format!(
            "load kept racing with compaction after {} attempts",
            READ_RETRIES
        )))
    }

    pub fn contains_key(&self, key: &[u8]) -> Result<bool> {
        Ok(self.load_entry(key)?.is_some())
    }

    /// Iterate a snapshot of the live entries
    ///
    /// Waits for a background rebuild to finish first.
    pub fn iterate(&self, options: IterateOptions) -> Result<EntryStream> {
        let running = self.running()?;
        running.recovery.wait()?;
        let now = self.clock.wall_clock_millis();

        for _ in 0..READ_RETRIES {
            let entries: Vec<IndexEntry> = running
                .index
                .snapshot()?
                .into_iter()
                .filter(|entry| options.wants_segment(entry.cache_segment) && !entry.is_expired(now))
                .collect();

            let mut pins = HashMap::new();
            let mut complete = true;
            for entry in &entries {
                let id = entry.location.segment;
                if pins.contains_key(&id) {
                    continue;
                }
                match running.log.pin(id) {
                    Some(segment) => {
                        pins.insert(id, segment);
                    }
                    None => {
                        complete = false;
                        break;
                    }
                }
            }
            if complete {
                return Ok(EntryStream::new(entries, pins, options));
            }
            tracing::trace!("Index snapshot referenced a deleted segment, retaking it");
        }
        Err(EmberError::Storage(format!(
            "could not pin an index snapshot after {} attempts",
            READ_RETRIES
        )))
    }

    /// Every live entry, for hosts that preload their in-memory cache
    pub fn preload_entries(&self) -> Result<EntryStream> {
        self.iterate(IterateOptions::default())
    }

    /// Live (unexpired) entries, optionally limited to some cache segments
    pub fn size(&self, segments: Option<&HashSet<u32>>) -> Result<u64> {
        let running = self.running()?;
        running.recovery.wait()?;
        let now = self.clock.wall_clock_millis();
        let count = running
            .index
            .snapshot()?
            .iter()
            .filter(|entry| segments.map_or(true, |s| s.contains(&entry.cache_segment)))
            .filter(|entry| !entry.is_expired(now))
            .count();
        Ok(count as u64)
    }

    /// Indexed entries, expired ones included; no I/O
    pub fn approximate_size(&self) -> Result<u64> {
        Ok(self.running()?.index.len())
    }

    // =========================================================================
    // Maintenance & Inspection
    // =========================================================================

    /// Run a compaction pass now
    pub fn compact_now(&self) -> Result<CompactionReport> {
        self.running()?.compactor.compact_now()
    }

    /// Outcome of startup recovery; `None` while a background rebuild runs
    pub fn recovery_report(&self) -> Result<Option<RecoveryReport>> {
        Ok(self.running()?.recovery.report())
    }

    /// Block until a background rebuild (if any) has finished
    pub fn wait_for_recovery(&self) -> Result<RecoveryReport> {
        self.running()?.recovery.wait()
    }

    pub fn index_stats(&self) -> Result<IndexStats> {
        Ok(self.running()?.index.stats())
    }

    /// Segment ids currently in the log, oldest first
    pub fn segment_ids(&self) -> Result<Vec<u64>> {
        Ok(self.running()?.log.list_segments())
    }

    /// Bytes held by segment files
    pub fn disk_usage(&self) -> Result<u64> {
        Ok(self.running()?.log.disk_usage())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn running(&self) -> Result<Arc<Running>> {
        self.running.read().clone().ok_or(EmberError::NotRunning)
    }

    fn submit(&self, mutation: Mutation) -> Result<Outcome> {
        self.running()?.writer.submit(mutation)
    }

    /// Key of the record an index entry points at, `None` if compaction has
    /// already moved it
    fn key_at(running: &Running, entry: &IndexEntry) -> Result<Option<Bytes>> {
        match running.log.read(&entry.location) {
            Ok(record) => Ok(Some(record.key)),
            Err(EmberError::SegmentNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn unexpected(outcome: Outcome) -> EmberError {
        EmberError::Storage(format!("unexpected writer outcome {:?}", outcome))
    }

    fn purge_locations(config: &Config) -> Result<()> {
        for dir in [&config.data_location, &config.index_location] {
            Self::remove_dir(dir)?;
        }
        tracing::info!("Purged store at {}", config.data_location.display());
        Ok(())
    }

    fn remove_dir(dir: &Path) -> Result<()> {
        match fs::remove_dir_all(dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for StoreEngine {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            tracing::error!("Error stopping store: {}", e);
        }
    }
}
