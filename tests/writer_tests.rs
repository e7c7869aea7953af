//! Tests for the Write Coordinator
//!
//! These tests verify:
//! - Writes are visible as soon as submit returns
//! - Delete semantics (tombstone only when the key is present)
//! - Compaction mutations re-check the index before applying
//! - Batches, clear and checkpoints
//! - Shutdown draining and rejection
//! - Concurrent submitters

use std::sync::Arc;
use std::thread;

use bytes::Bytes;
use emberkv::clock::{ControlledTimeService, TimeService};
use emberkv::compaction::UsageTracker;
use emberkv::config::SyncStrategy;
use emberkv::index::{IndexManager, RecordSource};
use emberkv::log::{LogManager, LogOptions, Record};
use emberkv::writer::{Applier, BatchOp, Mutation, Outcome, StartupTask, WriteCoordinator};
use emberkv::EmberError;
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

struct Harness {
    _temp: TempDir,
    log: Arc<LogManager>,
    index: Arc<IndexManager>,
    usage: Arc<UsageTracker>,
    clock: Arc<ControlledTimeService>,
    writer: WriteCoordinator,
}

fn setup_writer(checkpoint_interval: u64, startup: Option<StartupTask>) -> Harness {
    let temp = TempDir::new().unwrap();
    let log = Arc::new(
        LogManager::open(
            &temp.path().join("data"),
            LogOptions {
                max_file_size: 1024 * 1024,
                partitions: None,
                sync_strategy: SyncStrategy::EveryWrite,
            },
        )
        .unwrap(),
    );
    let source: Arc<dyn RecordSource> = log.clone();
    let index = Arc::new(IndexManager::open(&temp.path().join("index"), 16, 4, source).unwrap());
    let usage = Arc::new(UsageTracker::new());
    let clock = Arc::new(ControlledTimeService::default());
    let time: Arc<dyn TimeService> = clock.clone();

    let applier = Applier::new(
        Arc::clone(&log),
        Arc::clone(&index),
        Arc::clone(&usage),
        time,
        checkpoint_interval,
    );
    let writer = WriteCoordinator::start(applier, 8, startup).unwrap();
    Harness {
        _temp: temp,
        log,
        index,
        usage,
        clock,
        writer,
    }
}

fn write(harness: &Harness, key: &str, value: &str) -> Outcome {
    harness
        .writer
        .submit(Mutation::Write(Record::value(key.to_string(), value.to_string())))
        .unwrap()
}

fn delete(harness: &Harness, key: &str) -> Outcome {
    harness
        .writer
        .submit(Mutation::Delete {
            key: Bytes::from(key.to_string()),
            cache_segment: 0,
        })
        .unwrap()
}

fn value_of(harness: &Harness, key: &str) -> Option<Bytes> {
    harness
        .index
        .locate(key.as_bytes())
        .unwrap()
        .and_then(|(_, record)| record.value)
}

// =============================================================================
// Write / Delete Tests
// =============================================================================

#[test]
fn test_read_after_write() {
    let harness = setup_writer(1000, None);

    let Outcome::Written(location) = write(&harness, "k1", "v1") else {
        panic!("expected a write outcome");
    };

    assert_eq!(harness.index.lookup(b"k1").unwrap().unwrap().location, location);
    assert_eq!(value_of(&harness, "k1"), Some(Bytes::from_static(b"v1")));
    assert_eq!(harness.usage.get(location.segment).records, 1);
}

#[test]
fn test_overwrite_marks_previous_dead() {
    let harness = setup_writer(1000, None);
    write(&harness, "k1", "v1");
    write(&harness, "k1", "v2");

    assert_eq!(value_of(&harness, "k1"), Some(Bytes::from_static(b"v2")));
    let segment = harness.log.list_segments()[0];
    let usage = harness.usage.get(segment);
    assert_eq!(usage.records, 2);
    assert_eq!(usage.dead, 1);
}

#[test]
fn test_delete_present_and_absent() {
    let harness = setup_writer(1000, None);
    write(&harness, "k1", "v1");
    let before = harness.log.disk_usage();

    assert_eq!(delete(&harness, "k1"), Outcome::Removed(true));
    assert!(harness.log.disk_usage() > before, "tombstone appended");
    assert!(value_of(&harness, "k1").is_none());

    let after = harness.log.disk_usage();
    assert_eq!(delete(&harness, "k1"), Outcome::Removed(false));
    assert_eq!(harness.log.disk_usage(), after, "nothing appended for absent key");
}

#[test]
fn test_delete_of_expired_entry_reports_absent() {
    let harness = setup_writer(1000, None);
    let now = harness.clock.wall_clock_millis();
    harness
        .writer
        .submit(Mutation::Write(
            Record::value(&b"k"[..], &b"v"[..]).with_expiry(now + 10),
        ))
        .unwrap();
    harness.clock.advance(20);

    assert_eq!(delete(&harness, "k"), Outcome::Removed(false));
    assert!(harness.index.lookup(b"k").unwrap().is_none());
}

#[test]
fn test_tombstone_write_is_rejected() {
    let harness = setup_writer(1000, None);
    let result = harness
        .writer
        .submit(Mutation::Write(Record::tombstone(&b"k"[..], 0)));
    assert!(result.is_err());
    assert_eq!(harness.log.disk_usage(), 0);
}

#[test]
fn test_batch_applies_in_order() {
    let harness = setup_writer(1000, None);
    let ops = vec![
        BatchOp::Write(Record::value(&b"a"[..], &b"1"[..])),
        BatchOp::Write(Record::value(&b"b"[..], &b"2"[..])),
        BatchOp::Delete {
            key: Bytes::from_static(b"a"),
            cache_segment: 0,
        },
        BatchOp::Delete {
            key: Bytes::from_static(b"missing"),
            cache_segment: 0,
        },
    ];

    assert_eq!(harness.writer.submit(Mutation::Batch(ops)).unwrap(), Outcome::Batched(3));
    assert!(value_of(&harness, "a").is_none());
    assert_eq!(value_of(&harness, "b"), Some(Bytes::from_static(b"2")));
}

// =============================================================================
// Compaction Mutation Tests
// =============================================================================

#[test]
fn test_relocate_only_when_index_still_points_there() {
    let harness = setup_writer(1000, None);
    let Outcome::Written(old) = write(&harness, "k", "v1") else {
        panic!("expected a write outcome");
    };
    let record = harness.log.read(&old).unwrap();

    let outcome = harness
        .writer
        .submit(Mutation::Relocate {
            record: record.clone(),
            from: old,
        })
        .unwrap();
    assert_eq!(outcome, Outcome::Relocated(true));
    let moved = harness.index.lookup(b"k").unwrap().unwrap().location;
    assert_ne!(moved, old);

    // A stale copy must not clobber the newer write
    write(&harness, "k", "v2");
    let outcome = harness
        .writer
        .submit(Mutation::Relocate { record, from: old })
        .unwrap();
    assert_eq!(outcome, Outcome::Relocated(false));
    assert_eq!(value_of(&harness, "k"), Some(Bytes::from_static(b"v2")));
}

#[test]
fn test_expire_and_carry_tombstone() {
    let harness = setup_writer(1000, None);
    let Outcome::Written(location) = write(&harness, "k", "v") else {
        panic!("expected a write outcome");
    };

    let outcome = harness
        .writer
        .submit(Mutation::Expire {
            key: Bytes::from_static(b"k"),
            cache_segment: 0,
            from: location,
        })
        .unwrap();
    assert_eq!(outcome, Outcome::Removed(true));
    assert!(harness.index.lookup(b"k").unwrap().is_none());

    let carry = Mutation::CarryTombstone {
        key: Bytes::from_static(b"k"),
        cache_segment: 0,
    };
    assert_eq!(harness.writer.submit(carry).unwrap(), Outcome::Relocated(true));

    write(&harness, "k", "again");
    let carry = Mutation::CarryTombstone {
        key: Bytes::from_static(b"k"),
        cache_segment: 0,
    };
    assert_eq!(harness.writer.submit(carry).unwrap(), Outcome::Relocated(false));
    assert_eq!(value_of(&harness, "k"), Some(Bytes::from_static(b"again")));
}

// =============================================================================
// Clear / Checkpoint Tests
// =============================================================================

#[test]
fn test_clear() {
    let harness = setup_writer(1000, None);
    write(&harness, "a", "1");
    write(&harness, "b", "2");

    assert_eq!(harness.writer.submit(Mutation::Clear).unwrap(), Outcome::Cleared);
    assert!(harness.index.is_empty());
    assert!(harness.log.list_segments().is_empty());
    assert!(value_of(&harness, "a").is_none());

    write(&harness, "c", "3");
    assert_eq!(value_of(&harness, "c"), Some(Bytes::from_static(b"3")));
}

#[test]
fn test_periodic_checkpoint_matches_log() {
    let harness = setup_writer(3, None);
    for i in 0..3 {
        write(&harness, &format!("k{}", i), "v");
    }

    // Exactly at the interval: the checkpoint describes the current log
    let usage = harness.index.load(&harness.log.log_state()).unwrap();
    assert!(usage.is_some());
    assert_eq!(harness.index.len(), 3);
}

#[test]
fn test_explicit_checkpoint() {
    let harness = setup_writer(1000, None);
    write(&harness, "k", "v");
    assert!(harness.index.load(&harness.log.log_state()).unwrap().is_none());

    assert_eq!(
        harness.writer.submit(Mutation::Checkpoint).unwrap(),
        Outcome::Checkpointed
    );
    assert!(harness.index.load(&harness.log.log_state()).unwrap().is_some());
}

// =============================================================================
// Lifecycle Tests
// =============================================================================

#[test]
fn test_stop_checkpoints_and_rejects() {
    let harness = setup_writer(1000, None);
    write(&harness, "k", "v");

    harness.writer.stop().unwrap();

    assert!(!harness.writer.is_accepting());
    assert!(matches!(
        harness
            .writer
            .submit(Mutation::Write(Record::value(&b"x"[..], &b"y"[..]))),
        Err(EmberError::ShuttingDown)
    ));
    assert!(harness.index.load(&harness.log.log_state()).unwrap().is_some());
    // Second stop is a no-op
    harness.writer.stop().unwrap();
}

#[test]
fn test_startup_task_runs_before_queue() {
    let (tx, rx) = crossbeam::channel::unbounded();
    let task: StartupTask = Box::new(move || {
        tx.send("startup").unwrap();
        Ok(())
    });
    let harness = setup_writer(1000, Some(task));

    write(&harness, "k", "v");
    assert_eq!(rx.try_recv().unwrap(), "startup");
}

#[test]
fn test_failed_startup_task_fails_mutations() {
    let task: StartupTask = Box::new(|| Err(EmberError::Storage("boom".to_string())));
    let harness = setup_writer(1000, Some(task));

    let result = harness
        .writer
        .submit(Mutation::Write(Record::value(&b"k"[..], &b"v"[..])));
    assert!(matches!(result, Err(EmberError::RecoveryFailed(_))));
}

#[test]
fn test_concurrent_submitters() {
    let harness = Arc::new(setup_writer(50, None));

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let harness = Arc::clone(&harness);
            thread::spawn(move || {
                for i in 0..50 {
                    write(&harness, &format!("t{}-k{}", t, i), &format!("v{}", i));
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(harness.index.len(), 200);
    assert_eq!(value_of(&harness, "t3-k49"), Some(Bytes::from_static(b"v49")));
}
