//! Tests for Recovery
//!
//! These tests verify:
//! - A clean stop reloads the checkpoint without replay
//! - A missing or stale checkpoint triggers a full rebuild
//! - Torn tails are truncated, corrupt sealed segments fail startup
//! - Rebuilt state matches what was written (overwrites, deletes, expiry)
//! - Background rebuild serves loads before the index is ready

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use emberkv::{
    Config, ControlledTimeService, EmberError, Entry, RecoveryState, StoreEngine, TimeService,
};
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

// =============================================================================
// Helper Functions
// =============================================================================

/// Recovery decisions are logged; run with `RUST_LOG=emberkv=debug` to see them
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

fn config(root: &Path) -> Config {
    init_tracing();
    Config::builder()
        .root(root)
        .max_file_size(4096)
        .compaction_enabled(false)
        .index_pages(16)
        .index_cache_pages(4)
        .build()
}

fn setup_temp_store() -> (TempDir, StoreEngine) {
    let temp_dir = TempDir::new().unwrap();
    let engine = StoreEngine::open(config(temp_dir.path())).unwrap();
    (temp_dir, engine)
}

fn segment_files(root: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = fs::read_dir(root.join("data"))
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .filter(|path| path.extension().map_or(false, |ext| ext == "log"))
        .collect();
    files.sort();
    files
}

fn checkpoint_file(root: &Path) -> PathBuf {
    root.join("index").join("index.chk")
}

fn fill(engine: &StoreEngine, count: usize) {
    for i in 0..count {
        engine
            .write(Entry::new(format!("key{:04}", i), vec![b'v'; 200]))
            .unwrap();
    }
}

// =============================================================================
// Clean Restart Tests
// =============================================================================

#[test]
fn test_clean_stop_reloads_checkpoint() {
    let (temp, engine) = setup_temp_store();
    engine.write(Entry::new("k1", "v1")).unwrap();
    engine.stop().unwrap();

    let engine = StoreEngine::open(config(temp.path())).unwrap();
    let report = engine.recovery_report().unwrap().unwrap();

    assert_eq!(report.state, RecoveryState::Clean);
    assert_eq!(report.records_replayed, 0);
    assert_eq!(engine.load(b"k1").unwrap(), Some(Bytes::from_static(b"v1")));
}

#[test]
fn test_empty_store_starts_clean() {
    let temp = TempDir::new().unwrap();
    {
        let engine = StoreEngine::open(config(temp.path())).unwrap();
        engine.stop().unwrap();
    }
    let engine = StoreEngine::open(config(temp.path())).unwrap();
    assert_eq!(
        engine.recovery_report().unwrap().unwrap().state,
        RecoveryState::Clean
    );
    assert_eq!(engine.size(None).unwrap(), 0);
}

// =============================================================================
// Rebuild Tests
// =============================================================================

#[test]
fn test_missing_checkpoint_rebuilds() {
    let (temp, engine) = setup_temp_store();
    fill(&engine, 40);
    engine.write(Entry::new("key0003", "overwritten")).unwrap();
    assert!(engine.delete("key0007", 0).unwrap());
    engine.stop().unwrap();
    fs::remove_file(checkpoint_file(temp.path())).unwrap();

    let engine = StoreEngine::open(config(temp.path())).unwrap();
    let report = engine.recovery_report().unwrap().unwrap();

    assert_eq!(report.state, RecoveryState::Rebuilt);
    assert!(report.segments_replayed > 1);
    assert_eq!(report.records_replayed, 42);
    assert_eq!(report.truncated_bytes, 0);

    assert_eq!(engine.size(None).unwrap(), 39);
    assert_eq!(
        engine.load(b"key0003").unwrap(),
        Some(Bytes::from_static(b"overwritten"))
    );
    assert!(engine.load(b"key0007").unwrap().is_none());
    assert_eq!(engine.load(b"key0039").unwrap(), Some(Bytes::from(vec![b'v'; 200])));
}

#[test]
fn test_rebuild_matches_checkpointed_state() {
    let temp = TempDir::new().unwrap();
    let expected: Vec<(Bytes, Option<Bytes>)> = {
        let engine = StoreEngine::open(config(temp.path())).unwrap();
        fill(&engine, 30);
        for i in (0..30).step_by(3) {
            engine.delete(format!("key{:04}", i), 0).unwrap();
        }
        let keys: Vec<Bytes> = (0..30).map(|i| Bytes::from(format!("key{:04}", i))).collect();
        let expected = keys
            .into_iter()
            .map(|key| {
                let value = engine.load(&key).unwrap();
                (key, value)
            })
            .collect();
        engine.stop().unwrap();
        expected
    };
    fs::remove_file(checkpoint_file(temp.path())).unwrap();

    let engine = StoreEngine::open(config(temp.path())).unwrap();
    for (key, value) in &expected {
        assert_eq!(&engine.load(key).unwrap(), value, "{:?}", key);
    }
    assert_eq!(engine.size(None).unwrap(), 20);
}

#[test]
fn test_torn_tail_is_truncated() {
    let (temp, engine) = setup_temp_store();
    engine.write(Entry::new("k1", "v1")).unwrap();
    engine.write(Entry::new("k2", "v2")).unwrap();
    engine.stop().unwrap();

    // Simulate a crash halfway through the last append
    let active = segment_files(temp.path()).pop().unwrap();
    let len = fs::metadata(&active).unwrap().len();
    OpenOptions::new()
        .write(true)
        .open(&active)
        .unwrap()
        .set_len(len - 3)
        .unwrap();

    let engine = StoreEngine::open(config(temp.path())).unwrap();
    let report = engine.recovery_report().unwrap().unwrap();

    assert_eq!(report.state, RecoveryState::Rebuilt);
    assert!(report.truncated_bytes > 0);
    assert_eq!(engine.load(b"k1").unwrap(), Some(Bytes::from_static(b"v1")));
    assert!(engine.load(b"k2").unwrap().is_none());

    // The cut frame is gone for good and new writes land after it
    engine.write(Entry::new("k3", "v3")).unwrap();
    engine.stop().unwrap();
    let engine = StoreEngine::open(config(temp.path())).unwrap();
    assert_eq!(
        engine.recovery_report().unwrap().unwrap().state,
        RecoveryState::Clean
    );
    assert_eq!(engine.load(b"k3").unwrap(), Some(Bytes::from_static(b"v3")));
}

#[test]
fn test_corrupt_sealed_segment_fails_startup() {
    let (temp, engine) = setup_temp_store();
    fill(&engine, 40);
    engine.stop().unwrap();

    let files = segment_files(temp.path());
    assert!(files.len() > 1);
    let sealed = &files[0];
    let mut bytes = fs::read(sealed).unwrap();
    bytes[100] ^= 0xFF;
    fs::write(sealed, bytes).unwrap();
    fs::remove_file(checkpoint_file(temp.path())).unwrap();

    let result = StoreEngine::open(config(temp.path()));
    assert!(matches!(result, Err(EmberError::RecoveryFailed(_))));
}

#[test]
fn test_expired_entries_stay_expired_after_rebuild() {
    let temp = TempDir::new().unwrap();
    let clock = Arc::new(ControlledTimeService::default());
    let now = clock.wall_clock_millis();
    {
        let engine = StoreEngine::with_time_service(config(temp.path()), clock.clone());
        engine.start().unwrap();
        engine
            .write(Entry::new("short", "x").with_expiry(now + 100))
            .unwrap();
        engine.write(Entry::new("forever", "y")).unwrap();
        engine.stop().unwrap();
    }
    fs::remove_file(checkpoint_file(temp.path())).unwrap();
    clock.advance(500);

    let engine = StoreEngine::with_time_service(config(temp.path()), clock.clone());
    engine.start().unwrap();

    assert!(engine.load(b"short").unwrap().is_none());
    assert_eq!(engine.load(b"forever").unwrap(), Some(Bytes::from_static(b"y")));
    assert_eq!(engine.size(None).unwrap(), 1);
}

// =============================================================================
// Background Rebuild Tests
// =============================================================================

#[test]
fn test_background_rebuild_serves_loads() {
    let temp = TempDir::new().unwrap();
    {
        let engine = StoreEngine::open(config(temp.path())).unwrap();
        fill(&engine, 60);
        engine.write(Entry::new("key0010", "newer")).unwrap();
        engine.stop().unwrap();
    }
    fs::remove_file(checkpoint_file(temp.path())).unwrap();

    let mut background = config(temp.path());
    background.rebuild_in_background = true;
    let engine = StoreEngine::open(background).unwrap();

    // Answered by the index or a log scan, depending on timing
    assert_eq!(
        engine.load(b"key0010").unwrap(),
        Some(Bytes::from_static(b"newer"))
    );
    assert!(engine.load(b"missing").unwrap().is_none());

    let report = engine.wait_for_recovery().unwrap();
    assert_eq!(report.state, RecoveryState::Rebuilt);
    assert_eq!(engine.size(None).unwrap(), 60);

    engine.write(Entry::new("after", "rebuild")).unwrap();
    assert_eq!(engine.load(b"after").unwrap(), Some(Bytes::from_static(b"rebuild")));
}

#[test]
fn test_background_rebuild_failure_surfaces_on_use() {
    let temp = TempDir::new().unwrap();
    {
        let engine = StoreEngine::open(config(temp.path())).unwrap();
        fill(&engine, 40);
        engine.stop().unwrap();
    }
    let files = segment_files(temp.path());
    let mut bytes = fs::read(&files[0]).unwrap();
    bytes[100] ^= 0xFF;
    fs::write(&files[0], bytes).unwrap();
    fs::remove_file(checkpoint_file(temp.path())).unwrap();

    let mut background = config(temp.path());
    background.rebuild_in_background = true;
    let engine = StoreEngine::open(background).unwrap();

    assert!(engine.wait_for_recovery().is_err());
    assert_eq!(
        engine.recovery_report().unwrap().unwrap().state,
        RecoveryState::Failed
    );
    assert!(matches!(
        engine.load(b"key0001"),
        Err(EmberError::RecoveryFailed(_))
    ));
    assert!(matches!(
        engine.write(Entry::new("k", "v")),
        Err(EmberError::RecoveryFailed(_))
    ));
}
