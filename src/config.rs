//! Configuration for emberkv
//!
//! Centralized configuration with sensible defaults. Values are consumed as-is
//! from the host's config layer and checked by [`Config::validate`] when the
//! store starts.

use std::path::PathBuf;

use crate::error::{EmberError, Result};

/// Smallest accepted `max_file_size` (bytes)
pub const MIN_FILE_SIZE: u64 = 4 * 1024;

/// Main configuration for a store instance
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Location Configuration
    // -------------------------------------------------------------------------
    /// Directory holding the segment files
    ///   {data_location}/
    ///     ├── segment_000001.log
    ///     └── segment_000002.log   (active)
    pub data_location: PathBuf,

    /// Directory holding the index checkpoint and page files
    ///   {index_location}/
    ///     ├── index.chk
    ///     └── pages/page_00000.idx ...
    pub index_location: PathBuf,

    /// Discard all on-disk state when the store starts
    pub purge_on_startup: bool,

    /// Hosts intend to populate their in-memory structures at startup
    pub preload: bool,

    // -------------------------------------------------------------------------
    // Log Configuration
    // -------------------------------------------------------------------------
    /// Segment size (bytes) that triggers rotation
    pub max_file_size: u64,

    /// Split segment files by cache segment id
    pub segmented: bool,

    /// Number of cache segments (partitions) when `segmented` is set
    pub cache_segments: u32,

    /// Sync strategy: how often to fsync appended frames
    pub sync_strategy: SyncStrategy,

    // -------------------------------------------------------------------------
    // Writer Configuration
    // -------------------------------------------------------------------------
    /// Capacity of the bounded hand-off queue in front of the writer thread
    pub write_queue_capacity: usize,

    // -------------------------------------------------------------------------
    // Index Configuration
    // -------------------------------------------------------------------------
    /// Number of pages the key hash space is split into
    pub index_pages: u32,

    /// Max pages kept resident in memory
    pub index_cache_pages: usize,

    /// Mutations between index checkpoints
    pub index_checkpoint_interval: u64,

    /// Serve requests while the index is rebuilt (loads fall back to a scan)
    pub rebuild_in_background: bool,

    // -------------------------------------------------------------------------
    // Compaction Configuration
    // -------------------------------------------------------------------------
    /// Run the background compactor
    pub compaction_enabled: bool,

    /// Segments whose live fraction drops below this are compacted
    pub compaction_threshold: f64,

    /// Wakeup interval of the compactor (milliseconds)
    pub compaction_interval_ms: u64,
}

/// Log sync strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStrategy {
    /// fsync after every append (safest, slowest)
    EveryWrite,

    /// fsync after N appended frames (balanced durability/performance)
    EveryNEntries { count: usize },
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_location: PathBuf::from("./emberkv_data/data"),
            index_location: PathBuf::from("./emberkv_data/index"),
            purge_on_startup: false,
            preload: false,
            max_file_size: 16 * 1024 * 1024, // 16 MB
            segmented: false,
            cache_segments: 256,
            sync_strategy: SyncStrategy::EveryWrite,
            write_queue_capacity: 1024,
            index_pages: 1024,
            index_cache_pages: 256,
            index_checkpoint_interval: 10_000,
            rebuild_in_background: false,
            compaction_enabled: true,
            compaction_threshold: 0.5,
            compaction_interval_ms: 1000,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Reject conflicting or out-of-range options
    pub fn validate(&self) -> Result<()> {
        if self.data_location == self.index_location {
            return Err(EmberError::Config(format!(
                "data and index locations must differ (both are {})",
                self.data_location.display()
            )));
        }
        if self.max_file_size < MIN_FILE_SIZE {
            return Err(EmberError::Config(format!(
                "max_file_size must be at least {} bytes, got {}",
                MIN_FILE_SIZE, self.max_file_size
            )));
        }
        if self.segmented && self.cache_segments == 0 {
            return Err(EmberError::Config(
                "segmented mode requires cache_segments > 0".to_string(),
            ));
        }
        if let SyncStrategy::EveryNEntries { count: 0 } = self.sync_strategy {
            return Err(EmberError::Config(
                "EveryNEntries sync requires count > 0".to_string(),
            ));
        }
        if self.write_queue_capacity == 0 {
            return Err(EmberError::Config(
                "write_queue_capacity must be > 0".to_string(),
            ));
        }
        if self.index_pages == 0 || self.index_cache_pages == 0 {
            return Err(EmberError::Config(
                "index_pages and index_cache_pages must be > 0".to_string(),
            ));
        }
        if self.index_checkpoint_interval == 0 {
            return Err(EmberError::Config(
                "index_checkpoint_interval must be > 0".to_string(),
            ));
        }
        if !(self.compaction_threshold > 0.0 && self.compaction_threshold <= 1.0) {
            return Err(EmberError::Config(format!(
                "compaction_threshold must be in (0, 1], got {}",
                self.compaction_threshold
            )));
        }
        if self.compaction_interval_ms == 0 {
            return Err(EmberError::Config(
                "compaction_interval_ms must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Partition count handed to the log (None when not segmented)
    pub(crate) fn partitions(&self) -> Option<u32> {
        self.segmented.then_some(self.cache_segments)
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set both locations under one root: `{root}/data` and `{root}/index`
    pub fn root(mut self, path: impl Into<PathBuf>) -> Self {
        let root = path.into();
        self.config.data_location = root.join("data");
        self.config.index_location = root.join("index");
        self
    }

    /// Set the segment file directory
    pub fn data_location(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.data_location = path.into();
        self
    }

    /// Set the index directory
    pub fn index_location(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.index_location = path.into();
        self
    }

    pub fn purge_on_startup(mut self, purge: bool) -> Self {
        self.config.purge_on_startup = purge;
        self
    }

    pub fn preload(mut self, preload: bool) -> Self {
        self.config.preload = preload;
        self
    }

    /// Set the segment rotation size (in bytes)
    pub fn max_file_size(mut self, size: u64) -> Self {
        self.config.max_file_size = size;
        self
    }

    /// Enable per-cache-segment files with the given segment count
    pub fn segmented(mut self, cache_segments: u32) -> Self {
        self.config.segmented = true;
        self.config.cache_segments = cache_segments;
        self
    }

    pub fn sync_strategy(mut self, strategy: SyncStrategy) -> Self {
        self.config.sync_strategy = strategy;
        self
    }

    pub fn write_queue_capacity(mut self, capacity: usize) -> Self {
        self.config.write_queue_capacity = capacity;
        self
    }

    pub fn index_pages(mut self, pages: u32) -> Self {
        self.config.index_pages = pages;
        self
    }

    pub fn index_cache_pages(mut self, pages: usize) -> Self {
        self.config.index_cache_pages = pages;
        self
    }

    pub fn index_checkpoint_interval(mut self, mutations: u64) -> Self {
        self.config.index_checkpoint_interval = mutations;
        self
    }

    pub fn rebuild_in_background(mut self, enabled: bool) -> Self {
        self.config.rebuild_in_background = enabled;
        self
    }

    pub fn compaction_enabled(mut self, enabled: bool) -> Self {
        self.config.compaction_enabled = enabled;
        self
    }

    pub fn compaction_threshold(mut self, threshold: f64) -> Self {
        self.config.compaction_threshold = threshold;
        self
    }

    pub fn compaction_interval_ms(mut self, ms: u64) -> Self {
        self.config.compaction_interval_ms = ms;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
