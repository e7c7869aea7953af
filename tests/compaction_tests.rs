//! Tests for Compaction
//!
//! These tests verify:
//! - Compaction is invisible to readers (values unchanged, space reclaimed)
//! - Tombstones that still shadow older values are carried forward
//! - Tombstones in the oldest segment are dropped
//! - Deletes in segmented mode stay with the partition of the deleted value
//! - Expired records are removed instead of copied
//! - Iteration snapshots survive segments being compacted away
//! - Concurrent writers and deleters see their own writes while the
//!   background compactor runs, and a rebuild agrees with the final state

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use emberkv::{Config, ControlledTimeService, Entry, IterateOptions, StoreEngine, TimeService};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn config(root: &Path) -> Config {
    Config::builder()
        .root(root)
        .max_file_size(4096)
        .compaction_enabled(false)
        .compaction_threshold(0.5)
        .build()
}

fn setup_temp_store() -> (TempDir, StoreEngine) {
    let temp_dir = TempDir::new().unwrap();
    let engine = StoreEngine::open(config(temp_dir.path())).unwrap();
    (temp_dir, engine)
}

fn value(tag: &str) -> Bytes {
    let mut bytes = tag.as_bytes().to_vec();
    bytes.resize(200, b'.');
    Bytes::from(bytes)
}

/// Keep writing `churn{n}` keys until a new segment has been started;
/// returns the keys written
fn churn_until_rotation(engine: &StoreEngine, prefix: &str) -> Vec<String> {
    let before = engine.segment_ids().unwrap().len();
    let mut keys = Vec::new();
    while engine.segment_ids().unwrap().len() == before {
        let key = format!("{}{}", prefix, keys.len());
        engine.write(Entry::new(key.clone(), value("first"))).unwrap();
        keys.push(key);
    }
    keys
}

fn overwrite(engine: &StoreEngine, keys: &[String]) {
    for key in keys {
        engine.write(Entry::new(key.clone(), value("second"))).unwrap();
    }
}

fn restart_with_rebuild(temp: &TempDir, engine: StoreEngine) -> StoreEngine {
    engine.stop().unwrap();
    drop(engine);
    fs::remove_file(temp.path().join("index").join("index.chk")).unwrap();
    StoreEngine::open(config(temp.path())).unwrap()
}

// =============================================================================
// Transparency Tests
// =============================================================================

#[test]
fn test_compaction_is_transparent() {
    let (_temp, engine) = setup_temp_store();
    let keys: Vec<String> = (0..60).map(|i| format!("key{:03}", i)).collect();
    for key in &keys {
        engine.write(Entry::new(key.clone(), value("old"))).unwrap();
    }
    for key in &keys {
        engine.write(Entry::new(key.clone(), value(key))).unwrap();
    }
    let segments_before = engine.segment_ids().unwrap();
    let disk_before = engine.disk_usage().unwrap();

    let report = engine.compact_now().unwrap();

    assert!(report.segments_compacted > 0);
    assert!(report.bytes_reclaimed > 0);
    let segments_after = engine.segment_ids().unwrap();
    assert!(segments_after.len() < segments_before.len());
    assert!(!segments_after.contains(&segments_before[0]));
    assert!(engine.disk_usage().unwrap() < disk_before);

    for key in &keys {
        assert_eq!(engine.load(key.as_bytes()).unwrap(), Some(value(key)), "{}", key);
    }
    assert_eq!(engine.size(None).unwrap(), 60);
}

#[test]
fn test_nothing_to_compact() {
    let (_temp, engine) = setup_temp_store();
    for i in 0..40 {
        engine.write(Entry::new(format!("key{}", i), value("v"))).unwrap();
    }

    let report = engine.compact_now().unwrap();

    assert_eq!(report.segments_compacted, 0);
    assert_eq!(engine.size(None).unwrap(), 40);
}

#[test]
fn test_compacted_state_survives_rebuild() {
    let (temp, engine) = setup_temp_store();
    let keys = churn_until_rotation(&engine, "churn");
    overwrite(&engine, &keys);
    let more = churn_until_rotation(&engine, "more");
    engine.compact_now().unwrap();

    let engine = restart_with_rebuild(&temp, engine);

    for key in &keys {
        assert_eq!(engine.load(key.as_bytes()).unwrap(), Some(value("second")));
    }
    for key in &more {
        assert_eq!(engine.load(key.as_bytes()).unwrap(), Some(value("first")));
    }
}

// =============================================================================
// Tombstone Tests
// =============================================================================

#[test]
fn test_tombstone_carried_while_it_shadows_a_value() {
    let (temp, engine) = setup_temp_store();

    // Oldest segment: the victim plus long-lived keys
    engine.write(Entry::new("victim", value("doomed"))).unwrap();
    churn_until_rotation(&engine, "stable");

    // Second segment: the tombstone plus keys that are overwritten later
    assert!(engine.delete("victim", 0).unwrap());
    let churn = churn_until_rotation(&engine, "churn");
    overwrite(&engine, &churn);

    let report = engine.compact_now().unwrap();
    assert!(report.segments_compacted > 0);
    assert!(report.tombstones_carried >= 1);
    assert!(engine.load(b"victim").unwrap().is_none());

    // The old value is still on disk; only the carried tombstone hides it
    let engine = restart_with_rebuild(&temp, engine);
    assert!(engine.load(b"victim").unwrap().is_none());
    for key in &churn {
        assert_eq!(engine.load(key.as_bytes()).unwrap(), Some(value("second")));
    }
}

#[test]
fn test_tombstone_in_oldest_segment_is_dropped() {
    let (temp, engine) = setup_temp_store();
    engine.write(Entry::new("gone", value("x"))).unwrap();
    assert!(engine.delete("gone", 0).unwrap());
    let churn = churn_until_rotation(&engine, "churn");
    overwrite(&engine, &churn);
    let oldest = engine.segment_ids().unwrap()[0];

    let report = engine.compact_now().unwrap();

    assert!(!engine.segment_ids().unwrap().contains(&oldest));
    assert_eq!(report.tombstones_carried, 0);
    assert!(report.records_dropped > 0);

    let engine = restart_with_rebuild(&temp, engine);
    assert!(engine.load(b"gone").unwrap().is_none());
}

#[test]
fn test_segmented_delete_is_not_resurrected_by_compaction() {
    let temp = TempDir::new().unwrap();
    let segmented = Config::builder()
        .root(temp.path())
        .max_file_size(4096)
        .segmented(2)
        .compaction_enabled(false)
        .compaction_threshold(0.5)
        .build();
    let engine = StoreEngine::open(segmented.clone()).unwrap();

    engine
        .write(Entry::new("victim", value("v")).in_segment(0))
        .unwrap();
    // The caller names the wrong partition
    assert!(engine.delete("victim", 1).unwrap());

    // Fill partition 1 with garbage so its oldest segment gets compacted
    engine
        .write(Entry::new("churn0", value("first")).in_segment(1))
        .unwrap();
    let mut churn = vec!["churn0".to_string()];
    let before = engine.segment_ids().unwrap().len();
    while engine.segment_ids().unwrap().len() == before {
        let key = format!("churn{}", churn.len());
        engine
            .write(Entry::new(key.clone(), value("first")).in_segment(1))
            .unwrap();
        churn.push(key);
    }
    for key in &churn {
        engine
            .write(Entry::new(key.clone(), value("second")).in_segment(1))
            .unwrap();
    }

    let report = engine.compact_now().unwrap();
    assert!(report.segments_compacted > 0);
    assert!(engine.load(b"victim").unwrap().is_none());

    engine.stop().unwrap();
    drop(engine);
    fs::remove_file(temp.path().join("index").join("index.chk")).unwrap();
    let engine = StoreEngine::open(segmented).unwrap();

    assert!(engine.load(b"victim").unwrap().is_none());
    for key in &churn {
        assert_eq!(engine.load(key.as_bytes()).unwrap(), Some(value("second")));
    }
}

// =============================================================================
// Expiry Tests
// =============================================================================

#[test]
fn test_expired_records_are_removed_not_copied() {
    let temp = TempDir::new().unwrap();
    let clock = Arc::new(ControlledTimeService::default());
    let engine = StoreEngine::with_time_service(config(temp.path()), clock.clone());
    engine.start().unwrap();

    let deadline = clock.wall_clock_millis() + 100;
    for i in 0..3 {
        engine
            .write(Entry::new(format!("ttl{}", i), value("t")).with_expiry(deadline))
            .unwrap();
    }
    let churn = churn_until_rotation(&engine, "churn");
    overwrite(&engine, &churn);
    let indexed_before = engine.approximate_size().unwrap();

    clock.advance(1000);
    let report = engine.compact_now().unwrap();

    assert_eq!(report.records_expired, 3);
    assert_eq!(engine.approximate_size().unwrap(), indexed_before - 3);
    for i in 0..3 {
        assert!(engine.load(format!("ttl{}", i).as_bytes()).unwrap().is_none());
    }
}

// =============================================================================
// Concurrency Tests
// =============================================================================

#[test]
fn test_iteration_survives_compaction() {
    let (_temp, engine) = setup_temp_store();
    let keys: Vec<String> = (0..50).map(|i| format!("key{:03}", i)).collect();
    for key in &keys {
        engine.write(Entry::new(key.clone(), value("old"))).unwrap();
    }
    let stream = engine.iterate(IterateOptions::default()).unwrap();
    for key in &keys {
        engine.write(Entry::new(key.clone(), value("new"))).unwrap();
    }

    let report = engine.compact_now().unwrap();
    assert!(report.segments_compacted > 0);

    // The snapshot predates the overwrites and still reads the old copies
    let seen: Vec<_> = stream.map(|item| item.unwrap()).collect();
    assert_eq!(seen.len(), 50);
    assert!(seen.iter().all(|entry| entry.value == Some(value("old"))));

    let fresh: Vec<_> = engine
        .iterate(IterateOptions::default())
        .unwrap()
        .map(|item| item.unwrap())
        .collect();
    assert!(fresh.iter().all(|entry| entry.value == Some(value("new"))));
}

#[test]
fn test_background_compactor_reclaims_space() {
    let temp = TempDir::new().unwrap();
    let config = Config::builder()
        .root(temp.path())
        .max_file_size(4096)
        .compaction_enabled(true)
        .compaction_interval_ms(10)
        .build();
    let engine = StoreEngine::open(config).unwrap();

    let keys: Vec<String> = (0..40).map(|i| format!("key{:03}", i)).collect();
    for round in 0..5 {
        for key in &keys {
            engine
                .write(Entry::new(key.clone(), value(&format!("r{}", round))))
                .unwrap();
        }
    }

    let deadline = Instant::now() + Duration::from_secs(10);
    while engine.segment_ids().unwrap().len() > 6 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(20));
    }

    assert!(engine.segment_ids().unwrap().len() <= 6);
    for key in &keys {
        assert_eq!(engine.load(key.as_bytes()).unwrap(), Some(value("r4")));
    }
}

#[test]
fn test_concurrent_writers_and_deleters_during_compaction() {
    let temp = TempDir::new().unwrap();
    let busy = Config::builder()
        .root(temp.path())
        .max_file_size(4096)
        .compaction_enabled(true)
        .compaction_threshold(0.9)
        .compaction_interval_ms(1)
        .build();
    let engine = Arc::new(StoreEngine::open(busy).unwrap());

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                let mut expected: HashMap<String, Option<Bytes>> = HashMap::new();
                for i in 0..400 {
                    let key = format!("t{}-k{:02}", t, i % 20);
                    if i % 5 == 4 {
                        engine.delete(key.clone(), 0).unwrap();
                        assert!(engine.load(key.as_bytes()).unwrap().is_none(), "{}", key);
                        expected.insert(key, None);
                    } else {
                        let v = value(&format!("{}-{}", t, i));
                        engine.write(Entry::new(key.clone(), v.clone())).unwrap();
                        assert_eq!(engine.load(key.as_bytes()).unwrap(), Some(v.clone()), "{}", key);
                        expected.insert(key, Some(v));
                    }
                }
                expected
            })
        })
        .collect();

    let mut expected = HashMap::new();
    for handle in handles {
        expected.extend(handle.join().unwrap());
    }

    // Give the compactor a few more passes over the finished workload
    thread::sleep(Duration::from_millis(200));

    let live = expected.values().filter(|v| v.is_some()).count() as u64;
    for (key, value) in &expected {
        assert_eq!(&engine.load(key.as_bytes()).unwrap(), value, "{}", key);
    }
    assert_eq!(engine.size(None).unwrap(), live);

    let engine = match Arc::try_unwrap(engine) {
        Ok(engine) => engine,
        Err(_) => panic!("engine still shared"),
    };
    let engine = restart_with_rebuild(&temp, engine);

    for (key, value) in &expected {
        assert_eq!(&engine.load(key.as_bytes()).unwrap(), value, "{}", key);
    }
    assert_eq!(engine.size(None).unwrap(), live);
}
