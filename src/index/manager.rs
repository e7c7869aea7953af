//! Index Manager
//!
//! Key → latest [`Location`] map backed by page files.
//!
//! ## Responsibilities
//! - Hash lookup with collision resolution against the log
//! - Upsert/remove on behalf of the write coordinator (the only mutator)
//! - Bounded page residency (LRU per shard, write-back on eviction)
//! - Checkpoint and staleness-checked reload

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::compaction::SegmentUsage;
use crate::error::{EmberError, Result};
use crate::log::{Location, LogState, Record};

use super::checkpoint::{IndexCheckpoint, CHECKPOINT_VERSION};
use super::entry::{key_hash, IndexEntry};
use super::page::{Page, PageCache, PageStore};
use super::RecordSource;

const MAX_SHARDS: usize = 16;

/// Page cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexStats {
    pub entries: u64,
    pub resident_pages: usize,
    pub page_loads: u64,
    pub page_evictions: u64,
}

pub struct IndexManager {
    dir: PathBuf,
    page_count: u32,
    source: Arc<dyn RecordSource>,
    store: PageStore,
    shards: Vec<Mutex<PageCache>>,
    entries: AtomicU64,
    page_loads: AtomicU64,
    page_evictions: AtomicU64,
}

impl IndexManager {
    /// Open the index in `dir`
    ///
    /// Nothing is trusted until [`load`](Self::load) accepts the checkpoint;
    /// until then the index behaves as empty for counting purposes.
    pub fn open(
        dir: &Path,
        page_count: u32,
        cache_pages: usize,
        source: Arc<dyn RecordSource>,
    ) -> Result<Self> {
        if page_count == 0 {
            return Err(EmberError::Config("index_pages must be > 0".to_string()));
        }
        std::fs::create_dir_all(dir)?;
        let store = PageStore::open(dir.join("pages"))?;

        let cache_pages = cache_pages.max(1);
        let shard_count = cache_pages.min(MAX_SHARDS);
        let per_shard = cache_pages.div_ceil(shard_count);
        let shards = (0..shard_count)
            .map(|_| Mutex::new(PageCache::new(per_shard)))
            .collect();

        Ok(Self {
            dir: dir.to_path_buf(),
            page_count,
            source,
            store,
            shards,
            entries: AtomicU64::new(0),
            page_loads: AtomicU64::new(0),
            page_evictions: AtomicU64::new(0),
        })
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Verified entry for `key` together with the record it points at
    pub fn locate(&self, key: &[u8]) -> Result<Option<(IndexEntry, Record)>> {
        let hash = key_hash(key);
        let candidates = self.candidates(hash)?;
        self.resolve(key, candidates)
    }

    pub fn lookup(&self, key: &[u8]) -> Result<Option<IndexEntry>> {
        Ok(self.locate(key)?.map(|(entry, _)| entry))
    }

    /// Every entry, page by page
    ///
    /// Non-resident pages are read straight from disk without disturbing the
    /// cache.
    pub fn snapshot(&self) -> Result<Vec<IndexEntry>> {
        let mut out = Vec::with_capacity(self.len() as usize);
        for page_id in 0..self.page_count {
            let cache = self.shard(page_id).lock();
            match cache.peek(page_id) {
                Some(page) => out.extend(page.entries().copied()),
                None => out.extend(self.store.load(page_id)?.entries().copied()),
            }
        }
        Ok(out)
    }

    /// Lazy `(key, Location)` over every entry
    ///
    /// Keys are not stored in the index, so each item costs one log read.
    pub fn scan(&self) -> Result<IndexScan> {
        Ok(IndexScan {
            source: Arc::clone(&self.source),
            entries: self.snapshot()?.into_iter(),
        })
    }

    pub fn len(&self) -> u64 {
        self.entries.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> IndexStats {
        IndexStats {
            entries: self.len(),
            resident_pages: self.shards.iter().map(|s| s.lock().resident_pages()).sum(),
            page_loads: self.page_loads.load(Ordering::Relaxed),
            page_evictions: self.page_evictions.load(Ordering::Relaxed),
        }
    }

    // =========================================================================
    // Mutations (write coordinator / recovery only)
    // =========================================================================

    /// Point `key` at `entry`, returning the entry it replaced
    pub fn upsert(&self, key: &[u8], entry: IndexEntry) -> Result<Option<IndexEntry>> {
        let candidates = self.candidates(entry.hash)?;
        let previous = self.resolve(key, candidates)?.map(|(prev, _)| prev);

        let page_id = self.page_of(entry.hash);
        self.with_page(page_id, true, |page| match &previous {
            Some(prev) => {
                page.replace(&prev.location, entry);
            }
            None => page.insert(entry),
        })?;

        if previous.is_none() {
            self.entries.fetch_add(1, Ordering::SeqCst);
        }
        Ok(previous)
    }

    /// Drop `key`, returning the entry it had
    pub fn remove(&self, key: &[u8]) -> Result<Option<IndexEntry>> {
        let hash = key_hash(key);
        let candidates = self.candidates(hash)?;
        let Some((previous, _)) = self.resolve(key, candidates)? else {
            return Ok(None);
        };

        let page_id = self.page_of(hash);
        self.with_page(page_id, true, |page| page.remove(hash, &previous.location))?;
        self.entries.fetch_sub(1, Ordering::SeqCst);
        Ok(Some(previous))
    }

    /// Forget everything, on disk included
    pub fn clear(&self) -> Result<()> {
        let mut guards: Vec<_> = self.shards.iter().map(|s| s.lock()).collect();
        for cache in guards.iter_mut() {
            cache.reset();
        }
        self.store.clear()?;
        IndexCheckpoint::remove(&self.dir)?;
        self.entries.store(0, Ordering::SeqCst);
        Ok(())
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    /// Flush dirty pages, then record which log state they describe
    pub fn checkpoint(&self, log_state: LogState, usage: Vec<(u64, SegmentUsage)>) -> Result<()> {
        let mut flushed = 0;
        for shard in &self.shards {
            flushed += shard.lock().flush(&self.store)?;
        }

        let checkpoint = IndexCheckpoint {
            version: CHECKPOINT_VERSION,
            page_count: self.page_count,
            entry_count: self.len(),
            log_state,
            usage,
        };
        checkpoint.write(&self.dir)?;
        tracing::debug!(
            "Index checkpoint: {} entries, {} pages flushed",
            checkpoint.entry_count,
            flushed
        );
        Ok(())
    }

    /// Trust the persisted index if it matches `log_state` exactly
    ///
    /// Returns the usage counters stored with the checkpoint, or `None` when
    /// the checkpoint is missing or stale and the index must be rebuilt.
    pub fn load(&self, log_state: &LogState) -> Result<Option<Vec<(u64, SegmentUsage)>>> {
        let checkpoint = match IndexCheckpoint::read(&self.dir) {
            Ok(Some(checkpoint)) => checkpoint,
            Ok(None) => {
                tracing::info!("No index checkpoint found");
                return Ok(None);
            }
            Err(EmberError::IndexCorruption(reason)) => {
                tracing::warn!("Ignoring unreadable index checkpoint: {}", reason);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        if checkpoint.version != CHECKPOINT_VERSION {
            tracing::info!("Index checkpoint version {} is not supported", checkpoint.version);
            return Ok(None);
        }
        if checkpoint.page_count != self.page_count {
            tracing::info!(
                "Index checkpoint was built for {} pages, configured {}",
                checkpoint.page_count,
                self.page_count
            );
            return Ok(None);
        }
        if &checkpoint.log_state != log_state {
            tracing::info!("Index checkpoint does not match the log");
            return Ok(None);
        }

        let mut counted = 0u64;
        for page_id in self.store.stored_pages()? {
            if page_id >= self.page_count {
                tracing::warn!("Index page {} is out of range", page_id);
                return Ok(None);
            }
            match self.store.load(page_id) {
                Ok(page) => counted += page.len() as u64,
                Err(EmberError::IndexCorruption(reason)) => {
                    tracing::warn!("Index page rejected: {}", reason);
                    return Ok(None);
                }
                Err(e) => return Err(e),
            }
        }
        if counted != checkpoint.entry_count {
            tracing::warn!(
                "Index pages hold {} entries, checkpoint says {}",
                counted,
                checkpoint.entry_count
            );
            return Ok(None);
        }

        for shard in &self.shards {
            shard.lock().reset();
        }
        self.entries.store(counted, Ordering::SeqCst);
        Ok(Some(checkpoint.usage))
    }

    /// Pull pages into the cache until it is full; returns pages loaded
    pub fn warm(&self) -> Result<usize> {
        let mut loaded = 0;
        for page_id in self.store.stored_pages()? {
            if page_id >= self.page_count {
                continue;
            }
            {
                let cache = self.shard(page_id).lock();
                if cache.resident_pages() >= cache.capacity() || cache.peek(page_id).is_some() {
                    continue;
                }
            }
            self.with_page(page_id, false, |_| ())?;
            loaded += 1;
        }
        Ok(loaded)
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn page_of(&self, hash: u32) -> u32 {
        hash % self.page_count
    }

    fn shard(&self, page_id: u32) -> &Mutex<PageCache> {
        &self.shards[page_id as usize % self.shards.len()]
    }

    fn with_page<R>(&self, page_id: u32, dirty: bool, f: impl FnOnce(&mut Page) -> R) -> Result<R> {
        let mut cache = self.shard(page_id).lock();
        let (page, access) = cache.get_mut(page_id, &self.store, dirty)?;
        let out = f(page);
        drop(cache);

        if access.loaded {
            self.page_loads.fetch_add(1, Ordering::Relaxed);
        }
        if access.evicted {
            self.page_evictions.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("Index page cache evicted a page to load page {}", page_id);
        }
        Ok(out)
    }

    fn candidates(&self, hash: u32) -> Result<Vec<IndexEntry>> {
        self.with_page(self.page_of(hash), false, |page| page.candidates(hash).to_vec())
    }

    /// Disambiguate hash candidates by comparing key bytes read from the log
    ///
    /// Runs without holding any page lock.
    fn resolve(
        &self,
        key: &[u8],
        candidates: Vec<IndexEntry>,
    ) -> Result<Option<(IndexEntry, Record)>> {
        for candidate in candidates {
            let record = self.source.read_record(&candidate.location)?;
            if record.key.as_ref() == key {
                return Ok(Some((candidate, record)));
            }
        }
        Ok(None)
    }
}

/// Iterator returned by [`IndexManager::scan`]
pub struct IndexScan {
    source: Arc<dyn RecordSource>,
    entries: std::vec::IntoIter<IndexEntry>,
}

impl Iterator for IndexScan {
    type Item = Result<(Bytes, Location)>;

    fn next(&mut self) -> Option<Self::Item> {
        let entry = self.entries.next()?;
        Some(
            self.source
                .read_record(&entry.location)
                .map(|record| (record.key, entry.location)),
        )
    }
}
