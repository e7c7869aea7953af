//! Compactor
//!
//! Copies the live records out of mostly-dead sealed segments and deletes
//! them. All index changes go through the writer, which re-checks that the
//! index still points at the old copy before applying anything.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, Sender};
use crossbeam::select;
use parking_lot::Mutex;

use crate::clock::TimeService;
use crate::error::{EmberError, Result};
use crate::index::IndexManager;
use crate::log::LogManager;
use crate::recovery::RecoveryStatus;
use crate::writer::{Mutation, Outcome, WriteCoordinator};

use super::usage::UsageTracker;

/// Counters for one compaction pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionReport {
    pub segments_compacted: usize,
    pub records_relocated: u64,
    pub records_expired: u64,
    pub tombstones_carried: u64,
    pub records_dropped: u64,
    pub bytes_reclaimed: u64,
}

pub struct Compactor {
    log: Arc<LogManager>,
    index: Arc<IndexManager>,
    usage: Arc<UsageTracker>,
    writer: Arc<WriteCoordinator>,
    clock: Arc<dyn TimeService>,
    recovery: Arc<RecoveryStatus>,
    threshold: f64,
    /// One pass at a time
    pass: Mutex<()>,
    halted: AtomicBool,
}

impl Compactor {
    pub fn new(
        log: Arc<LogManager>,
        index: Arc<IndexManager>,
        usage: Arc<UsageTracker>,
        writer: Arc<WriteCoordinator>,
        clock: Arc<dyn TimeService>,
        recovery: Arc<RecoveryStatus>,
        threshold: f64,
    ) -> Self {
        Self {
            log,
            index,
            usage,
            writer,
            clock,
            recovery,
            threshold,
            pass: Mutex::new(()),
            halted: AtomicBool::new(false),
        }
    }

    /// Sealed segments below the threshold, lowest live fraction first
    pub fn candidates(&self) -> Vec<(u64, f64)> {
        let mut candidates: Vec<(u64, f64)> = self
            .log
            .list_segments()
            .into_iter()
            .filter(|id| self.log.is_sealed(*id))
            .map(|id| {
                let oldest = self.log.is_oldest_in_partition(id);
                (id, self.usage.get(id).live_fraction(oldest))
            })
            .filter(|(_, fraction)| *fraction < self.threshold)
            .collect();
        candidates.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        candidates
    }

    /// Run one synchronous pass over every candidate
    ///
    /// Does nothing while a background index rebuild is in progress.
    pub fn compact_now(&self) -> Result<CompactionReport> {
        let mut report = CompactionReport::default();
        if self.recovery.is_rebuilding() {
            return Ok(report);
        }

        let _pass = self.pass.lock();
        for (id, fraction) in self.candidates() {
            if self.halted.load(Ordering::SeqCst) {
                break;
            }
            tracing::debug!("Compacting segment {} (live fraction {:.2})", id, fraction);
            self.compact_segment(id, &mut report)?;
        }
        Ok(report)
    }

    fn halt(&self) {
        self.halted.store(true, Ordering::SeqCst);
    }

    fn compact_segment(&self, id: u64, report: &mut CompactionReport) -> Result<()> {
        let Some(segment) = self.log.pin(id) else {
            return Ok(());
        };
        let size = segment.len();
        drop(segment);

        let oldest = self.log.is_oldest_in_partition(id);
        let now = self.clock.wall_clock_millis();
        let scanner = match self.log.scan(id) {
            Ok(scanner) => scanner,
            Err(EmberError::SegmentNotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        };

        let (mut relocated, mut expired, mut carried, mut dropped) = (0u64, 0u64, 0u64, 0u64);
        for item in scanner {
            let (location, record) = item?;

            if record.is_tombstone() {
                // Nothing older in the partition left to shadow, or the key
                // has been written again since
                if oldest || self.index.lookup(&record.key)?.is_some() {
                    dropped += 1;
                    continue;
                }
                let mutation = Mutation::CarryTombstone {
                    key: record.key,
                    cache_segment: record.cache_segment,
                };
                match self.writer.submit(mutation)? {
                    Outcome::Relocated(true) => carried += 1,
                    _ => dropped += 1,
                }
                continue;
            }

            let current = self.index.lookup(&record.key)?;
            if current.map_or(true, |entry| entry.location != location) {
                dropped += 1;
                continue;
            }

            if record.is_expired(now) {
                let mutation = Mutation::Expire {
                    key: record.key,
                    cache_segment: record.cache_segment,
                    from: location,
                };
                match self.writer.submit(mutation)? {
                    Outcome::Removed(true) => expired += 1,
                    _ => dropped += 1,
                }
            } else {
                match self.writer.submit(Mutation::Relocate {
                    record,
                    from: location,
                })? {
                    Outcome::Relocated(true) => relocated += 1,
                    _ => dropped += 1,
                }
            }
        }

        // Copies must be durable before the originals go away
        self.log.sync()?;
        if self.log.seal_and_delete(id)? {
            self.usage.remove(id);
            report.segments_compacted += 1;
            report.bytes_reclaimed += size;
        }
        report.records_relocated += relocated;
        report.records_expired += expired;
        report.tombstones_carried += carried;
        report.records_dropped += dropped;

        tracing::info!(
            "Compacted segment {}: {} relocated, {} expired, {} tombstones carried, {} dropped",
            id,
            relocated,
            expired,
            carried,
            dropped
        );
        Ok(())
    }
}

// =============================================================================
// Background Thread
// =============================================================================

/// Handle on the compactor thread; stops and joins it on drop
pub struct CompactorHandle {
    compactor: Arc<Compactor>,
    shutdown: Option<Sender<()>>,
    join: Option<JoinHandle<()>>,
}

impl CompactorHandle {
    /// Run passes every `interval` and whenever a segment is sealed
    pub fn spawn(compactor: Arc<Compactor>, interval: Duration, seals: Receiver<u64>) -> Result<Self> {
        let (shutdown, shutdown_rx) = channel::bounded::<()>(0);
        let worker = Arc::clone(&compactor);
        let join = thread::Builder::new()
            .name("emberkv-compactor".to_string())
            .spawn(move || Self::run(worker, interval, seals, shutdown_rx))?;

        Ok(Self {
            compactor,
            shutdown: Some(shutdown),
            join: Some(join),
        })
    }

    fn run(compactor: Arc<Compactor>, interval: Duration, seals: Receiver<u64>, shutdown: Receiver<()>) {
        let ticker = channel::tick(interval);
        let closed = channel::never();
        let mut seals_open = true;
        loop {
            let sealed_rx = if seals_open { &seals } else { &closed };
            select! {
                recv(shutdown) -> _ => break,
                recv(ticker) -> _ => {},
                recv(sealed_rx) -> sealed => match sealed {
                    Ok(id) => tracing::trace!("Segment {} sealed, checking for compaction", id),
                    Err(_) => seals_open = false,
                },
            }

            match compactor.compact_now() {
                Ok(report) if report.segments_compacted > 0 => {
                    tracing::debug!("Compaction pass finished: {:?}", report);
                }
                Ok(_) => {}
                Err(EmberError::ShuttingDown) => break,
                Err(e) => tracing::warn!("Compaction pass failed: {}", e),
            }
        }
        tracing::debug!("Compactor thread exiting");
    }

    /// Stop after the current segment and join the thread
    pub fn stop(&mut self) {
        self.compactor.halt();
        // Dropping the sender disconnects the shutdown channel
        self.shutdown.take();
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                tracing::error!("Compactor thread panicked");
            }
        }
    }
}

impl Drop for CompactorHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
