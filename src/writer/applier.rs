//! Applies mutations to the log and index
//!
//! Owned by the writer thread; nothing else mutates the index while the
//! store is running.

use std::sync::Arc;

use bytes::Bytes;

use crate::clock::TimeService;
use crate::compaction::UsageTracker;
use crate::error::{EmberError, Result};
use crate::index::{IndexEntry, IndexManager};
use crate::log::{Location, LogManager, Record};

use super::{BatchOp, Mutation, Outcome};

pub struct Applier {
    log: Arc<LogManager>,
    index: Arc<IndexManager>,
    usage: Arc<UsageTracker>,
    clock: Arc<dyn TimeService>,
    checkpoint_interval: u64,
    since_checkpoint: u64,
}

impl Applier {
    pub fn new(
        log: Arc<LogManager>,
        index: Arc<IndexManager>,
        usage: Arc<UsageTracker>,
        clock: Arc<dyn TimeService>,
        checkpoint_interval: u64,
    ) -> Self {
        Self {
            log,
            index,
            usage,
            clock,
            checkpoint_interval,
            since_checkpoint: 0,
        }
    }

    pub fn apply(&mut self, mutation: Mutation) -> Result<Outcome> {
        let outcome = match mutation {
            Mutation::Write(record) => Outcome::Written(self.write(record)?),
            Mutation::Delete { key, cache_segment } => {
                Outcome::Removed(self.delete(key, cache_segment)?)
            }
            Mutation::Batch(ops) => Outcome::Batched(self.batch(ops)?),
            Mutation::Relocate { record, from } => Outcome::Relocated(self.relocate(record, from)?),
            Mutation::Expire {
                key,
                cache_segment,
                from,
            } => Outcome::Removed(self.expire(key, cache_segment, from)?),
            Mutation::CarryTombstone { key, cache_segment } => {
                Outcome::Relocated(self.carry_tombstone(key, cache_segment)?)
            }
            Mutation::Clear => {
                self.clear()?;
                return Ok(Outcome::Cleared);
            }
            Mutation::Checkpoint => {
                self.checkpoint()?;
                return Ok(Outcome::Checkpointed);
            }
        };

        self.since_checkpoint += 1;
        if self.since_checkpoint >= self.checkpoint_interval {
            // The mutation itself is durable; a failed checkpoint only means
            // the next startup rebuilds
            if let Err(e) = self.checkpoint() {
                tracing::warn!("Periodic index checkpoint failed: {}", e);
            }
        }
        Ok(outcome)
    }

    /// Sync the log, flush the index and record the pair as consistent
    pub fn checkpoint(&mut self) -> Result<()> {
        self.log.sync()?;
        self.index
            .checkpoint(self.log.log_state(), self.usage.snapshot())?;
        self.since_checkpoint = 0;
        Ok(())
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    fn write(&mut self, record: Record) -> Result<Location> {
        if record.is_tombstone() {
            return Err(EmberError::Storage(
                "tombstones are written through Delete".to_string(),
            ));
        }
        let location = self.log.append(&record)?;
        let entry = IndexEntry::for_record(&record, location);
        let previous = match self.index.upsert(&record.key, entry) {
            Ok(previous) => previous,
            Err(e) => return Err(self.undo(location, e)),
        };

        self.usage.record_append(location.segment, false);
        if let Some(previous) = previous {
            self.usage.record_dead(previous.location.segment);
        }
        Ok(location)
    }

    /// Returns whether a live (unexpired) entry was removed
    ///
    /// An expired entry is still cleaned up, but reported as absent. The
    /// tombstone lands in the partition holding the indexed record, so it can
    /// never sit in an older segment than the value it shadows.
    fn delete(&mut self, key: Bytes, requested_segment: u32) -> Result<bool> {
        let Some(current) = self.index.lookup(&key)? else {
            return Ok(false);
        };
        if requested_segment != current.cache_segment {
            tracing::trace!(
                "Delete asked for cache segment {}, record lives in {}",
                requested_segment,
                current.cache_segment
            );
        }
        self.append_removal(key, current.cache_segment)?;
        Ok(!current.is_expired(self.clock.wall_clock_millis()))
    }

    fn batch(&mut self, ops: Vec<BatchOp>) -> Result<usize> {
        let mut changed = 0;
        for op in ops {
            match op {
                BatchOp::Write(record) => {
                    self.write(record)?;
                    changed += 1;
                }
                BatchOp::Delete { key, cache_segment } => {
                    if self.delete(key, cache_segment)? {
                        changed += 1;
                    }
                }
            }
        }
        Ok(changed)
    }

    fn relocate(&mut self, record: Record, from: Location) -> Result<bool> {
        if !self.still_at(&record.key, &from)? {
            return Ok(false);
        }
        self.write(record)?;
        Ok(true)
    }

    fn expire(&mut self, key: Bytes, cache_segment: u32, from: Location) -> Result<bool> {
        if !self.still_at(&key, &from)? {
            return Ok(false);
        }
        self.append_removal(key, cache_segment)?;
        Ok(true)
    }

    fn carry_tombstone(&mut self, key: Bytes, cache_segment: u32) -> Result<bool> {
        if self.index.lookup(&key)?.is_some() {
            return Ok(false);
        }
        let location = self.log.append(&Record::tombstone(key, cache_segment))?;
        self.usage.record_append(location.segment, true);
        Ok(true)
    }

    fn clear(&mut self) -> Result<()> {
        self.log.clear()?;
        self.index.clear()?;
        self.usage.clear();
        self.checkpoint()?;
        tracing::info!("Store cleared");
        Ok(())
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    /// Tombstone + index removal for a key known to be indexed
    fn append_removal(&mut self, key: Bytes, cache_segment: u32) -> Result<()> {
        let tombstone = Record::tombstone(key, cache_segment);
        let location = self.log.append(&tombstone)?;
        let previous = match self.index.remove(&tombstone.key) {
            Ok(previous) => previous,
            Err(e) => return Err(self.undo(location, e)),
        };

        self.usage.record_append(location.segment, true);
        if let Some(previous) = previous {
            self.usage.record_dead(previous.location.segment);
        }
        Ok(())
    }

    fn still_at(&self, key: &[u8], from: &Location) -> Result<bool> {
        Ok(self
            .index
            .lookup(key)?
            .map_or(false, |entry| &entry.location == from))
    }

    /// Roll back an append whose index update failed, passing the error on
    fn undo(&self, location: Location, cause: EmberError) -> EmberError {
        if let Err(e) = self.log.rollback(&location) {
            tracing::error!(
                "Failed to roll back append at {:?} after index error ({}): {}",
                location,
                cause,
                e
            );
        }
        cause
    }
}
