//! Recovery
//!
//! Decides at startup whether the persisted index can be trusted, and
//! rebuilds it from the log when it cannot.
//!
//! ## States
//! ```text
//!            load() matches the log
//!   start ─────────────────────────────► CLEAN
//!     │
//!     └─ missing/stale ─► REBUILDING ──► REBUILT
//!                              │
//!                              └────────► FAILED (I/O error, corrupt sealed segment)
//! ```

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::compaction::UsageTracker;
use crate::error::{EmberError, Result};
use crate::index::{IndexEntry, IndexManager};
use crate::log::{Location, LogManager, Record};

/// Outcome of startup recovery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryState {
    /// The checkpointed index matched the log
    Clean,
    /// The index was rebuilt by replaying the log
    Rebuilt,
    Failed,
}

/// What recovery did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    pub state: RecoveryState,
    pub segments_replayed: usize,
    pub records_replayed: u64,
    /// Bytes cut from torn segment tails
    pub truncated_bytes: u64,
}

impl RecoveryReport {
    fn clean() -> Self {
        Self {
            state: RecoveryState::Clean,
            segments_replayed: 0,
            records_replayed: 0,
            truncated_bytes: 0,
        }
    }
}

/// Replays the log into the index
pub struct RecoveryCoordinator {
    log: Arc<LogManager>,
    index: Arc<IndexManager>,
    usage: Arc<UsageTracker>,
}

impl RecoveryCoordinator {
    pub fn new(log: Arc<LogManager>, index: Arc<IndexManager>, usage: Arc<UsageTracker>) -> Self {
        Self { log, index, usage }
    }

    /// Trust the checkpoint or rebuild; errors come back as `RecoveryFailed`
    pub fn run(&self) -> Result<RecoveryReport> {
        let result = match self.check() {
            Ok(true) => Ok(RecoveryReport::clean()),
            Ok(false) => self.rebuild(),
            Err(e) => Err(e),
        };

        match result {
            Ok(report) => {
                tracing::info!(
                    "Recovery {:?}: {} entries, {} segments replayed, {} records, {} bytes truncated",
                    report.state,
                    self.index.len(),
                    report.segments_replayed,
                    report.records_replayed,
                    report.truncated_bytes
                );
                Ok(report)
            }
            Err(e) => {
                tracing::error!("Recovery failed: {}", e);
                Err(EmberError::RecoveryFailed(Box::new(e)))
            }
        }
    }

    /// Load the checkpoint if it describes the log exactly
    pub fn check(&self) -> Result<bool> {
        match self.index.load(&self.log.log_state())? {
            Some(usage) => {
                self.usage.restore(usage);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Clear the index and replay every segment, oldest first
    ///
    /// A bad frame in the newest segment of a partition is a torn tail from
    /// a crash: the segment is cut back to its last valid frame. A bad frame
    /// anywhere else is corruption and aborts the rebuild.
    pub fn rebuild(&self) -> Result<RecoveryReport> {
        tracing::info!("Rebuilding index from {} segments", self.log.list_segments().len());
        self.index.clear()?;
        self.usage.clear();

        let mut report = RecoveryReport {
            state: RecoveryState::Rebuilt,
            segments_replayed: 0,
            records_replayed: 0,
            truncated_bytes: 0,
        };

        for id in self.log.list_segments() {
            let mut scanner = self.log.scan(id)?;
            while let Some(item) = scanner.next() {
                match item {
                    Ok((location, record)) => {
                        self.replay(location, &record)?;
                        report.records_replayed += 1;
                    }
                    Err(e) if e.is_corruption() && self.log.is_newest_in_partition(id) => {
                        tracing::warn!("Torn tail in segment {}: {}", id, e);
                        report.truncated_bytes += self.log.truncate(id, scanner.valid_end())?;
                        break;
                    }
                    Err(e) => return Err(e),
                }
            }
            report.segments_replayed += 1;
        }

        self.index
            .checkpoint(self.log.log_state(), self.usage.snapshot())?;
        Ok(report)
    }

    fn replay(&self, location: Location, record: &Record) -> Result<()> {
        let previous = if record.is_tombstone() {
            self.index.remove(&record.key)?
        } else {
            self.index
                .upsert(&record.key, IndexEntry::for_record(record, location))?
        };
        self.usage.record_append(location.segment, record.is_tombstone());
        if let Some(previous) = previous {
            self.usage.record_dead(previous.location.segment);
        }
        Ok(())
    }
}

// =============================================================================
// Background Rebuild Status
// =============================================================================

#[derive(Debug, Clone)]
enum Phase {
    Rebuilding,
    Done(RecoveryReport),
    Failed(String),
}

/// Shared view of recovery progress
///
/// Lets readers fall back to a log scan, and iteration wait, while a
/// background rebuild runs on the writer thread.
#[derive(Debug)]
pub struct RecoveryStatus {
    phase: Mutex<Phase>,
    changed: Condvar,
}

impl RecoveryStatus {
    pub fn rebuilding() -> Self {
        Self {
            phase: Mutex::new(Phase::Rebuilding),
            changed: Condvar::new(),
        }
    }

    pub fn finished(report: RecoveryReport) -> Self {
        Self {
            phase: Mutex::new(Phase::Done(report)),
            changed: Condvar::new(),
        }
    }

    pub fn complete(&self, result: &Result<RecoveryReport>) {
        let mut phase = self.phase.lock();
        *phase = match result {
            Ok(report) => Phase::Done(report.clone()),
            Err(e) => Phase::Failed(e.to_string()),
        };
        self.changed.notify_all();
    }

    pub fn is_rebuilding(&self) -> bool {
        matches!(*self.phase.lock(), Phase::Rebuilding)
    }

    /// `Ok(true)` once the index is usable, `Ok(false)` while it is being
    /// rebuilt
    pub fn ready(&self) -> Result<bool> {
        match &*self.phase.lock() {
            Phase::Rebuilding => Ok(false),
            Phase::Done(_) => Ok(true),
            Phase::Failed(reason) => Err(Self::failure(reason)),
        }
    }

    fn failure(reason: &str) -> EmberError {
        EmberError::RecoveryFailed(Box::new(EmberError::Storage(reason.to_string())))
    }

    /// Report once recovery is over, `None` while it is still running
    pub fn report(&self) -> Option<RecoveryReport> {
        match &*self.phase.lock() {
            Phase::Done(report) => Some(report.clone()),
            Phase::Failed(_) => Some(RecoveryReport {
                state: RecoveryState::Failed,
                segments_replayed: 0,
                records_replayed: 0,
                truncated_bytes: 0,
            }),
            Phase::Rebuilding => None,
        }
    }

    /// Block until recovery is over
    pub fn wait(&self) -> Result<RecoveryReport> {
        let mut phase = self.phase.lock();
        loop {
            match &*phase {
                Phase::Rebuilding => self.changed.wait(&mut phase),
                Phase::Done(report) => return Ok(report.clone()),
                Phase::Failed(reason) => return Err(Self::failure(reason)),
            }
        }
    }
}
