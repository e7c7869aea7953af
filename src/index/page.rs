//! Index pages and the resident page cache
//!
//! The hash space is split into a fixed number of pages. Each page is a set
//! of bucket chains (hash → entries) persisted as one file:
//!
//! ```text
//! pages/page_00042.idx = [crc32 u32][bincode(Page)]
//! ```
//!
//! At most `capacity` pages per shard are resident; the least recently used
//! one is written back (if dirty) and dropped to make room.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

use lru::LruCache;
use serde::{Deserialize, Serialize};

use crate::error::{EmberError, Result};
use crate::log::Location;

use super::entry::IndexEntry;

/// One page of bucket chains
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Page {
    buckets: BTreeMap<u32, Vec<IndexEntry>>,
}

impl Page {
    /// Entries sharing `hash`
    pub fn candidates(&self, hash: u32) -> &[IndexEntry] {
        self.buckets.get(&hash).map_or(&[], |chain| chain.as_slice())
    }

    /// Replace the entry at `location` in the chain for `entry.hash`
    pub fn replace(&mut self, location: &Location, entry: IndexEntry) -> Option<IndexEntry> {
        let chain = self.buckets.get_mut(&entry.hash)?;
        let slot = chain.iter_mut().find(|e| &e.location == location)?;
        Some(std::mem::replace(slot, entry))
    }

    pub fn insert(&mut self, entry: IndexEntry) {
        self.buckets.entry(entry.hash).or_default().push(entry);
    }

    /// Remove the entry at `location` from the chain for `hash`
    pub fn remove(&mut self, hash: u32, location: &Location) -> Option<IndexEntry> {
        let chain = self.buckets.get_mut(&hash)?;
        let pos = chain.iter().position(|e| &e.location == location)?;
        let removed = chain.swap_remove(pos);
        if chain.is_empty() {
            self.buckets.remove(&hash);
        }
        Some(removed)
    }

    pub fn entries(&self) -> impl Iterator<Item = &IndexEntry> {
        self.buckets.values().flatten()
    }

    pub fn len(&self) -> usize {
        self.buckets.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    fn encode(&self) -> Result<Vec<u8>> {
        let body = bincode::serialize(self)?;
        let mut out = Vec::with_capacity(4 + body.len());
        out.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }

    fn decode(page_id: u32, bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 4 {
            return Err(EmberError::IndexCorruption(format!(
                "page {} is truncated",
                page_id
            )));
        }
        let (crc, body) = bytes.split_at(4);
        let stored = u32::from_le_bytes([crc[0], crc[1], crc[2], crc[3]]);
        if stored != crc32fast::hash(body) {
            return Err(EmberError::IndexCorruption(format!(
                "page {} failed its checksum",
                page_id
            )));
        }
        bincode::deserialize(body)
            .map_err(|e| EmberError::IndexCorruption(format!("page {}: {}", page_id, e)))
    }
}

// =============================================================================
// Page Store (on-disk side)
// =============================================================================

/// Page files under `{index_location}/pages`
#[derive(Debug)]
pub(crate) struct PageStore {
    dir: PathBuf,
}

impl PageStore {
    pub(crate) fn open(dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path(&self, page_id: u32) -> PathBuf {
        self.dir.join(format!("page_{:05}.idx", page_id))
    }

    /// Load a page; a missing file is an empty page
    pub(crate) fn load(&self, page_id: u32) -> Result<Page> {
        match fs::read(self.path(page_id)) {
            Ok(bytes) => Page::decode(page_id, &bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Page::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Persist a page atomically (write to tmp, then rename)
    pub(crate) fn store(&self, page_id: u32, page: &Page) -> Result<()> {
        let path = self.path(page_id);
        if page.is_empty() {
            return match fs::remove_file(&path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            };
        }
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, page.encode()?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Ids of every page present on disk
    pub(crate) fn stored_pages(&self) -> Result<Vec<u32>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if let Some(id) = Self::parse_page_id(&path) {
                ids.push(id);
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    pub(crate) fn clear(&self) -> Result<()> {
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.is_file() {
                fs::remove_file(&path)?;
            }
        }
        Ok(())
    }

    /// "page_00042.idx" → Some(42)
    fn parse_page_id(path: &Path) -> Option<u32> {
        if path.extension()? != "idx" {
            return None;
        }
        let name = path.file_stem()?.to_string_lossy();
        name.strip_prefix("page_")?.parse().ok()
    }
}

// =============================================================================
// Page Cache (resident side)
// =============================================================================

struct Resident {
    page: Page,
    dirty: bool,
}

/// Bounded LRU of resident pages for one lock shard
pub(crate) struct PageCache {
    resident: LruCache<u32, Resident>,
}

/// What a cache access had to do
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct Access {
    pub loaded: bool,
    pub evicted: bool,
}

impl PageCache {
    pub(crate) fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            resident: LruCache::new(capacity),
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.resident.cap().get()
    }

    pub(crate) fn resident_pages(&self) -> usize {
        self.resident.len()
    }

    /// Resident copy of a page, without loading or touching recency
    pub(crate) fn peek(&self, page_id: u32) -> Option<&Page> {
        self.resident.peek(&page_id).map(|r| &r.page)
    }

    /// Make `page_id` resident and most recently used, then hand it out
    pub(crate) fn get_mut(
        &mut self,
        page_id: u32,
        store: &PageStore,
        dirty: bool,
    ) -> Result<(&mut Page, Access)> {
        let mut access = Access::default();
        if !self.resident.contains(&page_id) {
            if self.resident.len() >= self.capacity() {
                self.evict_one(store)?;
                access.evicted = true;
            }
            let page = store.load(page_id)?;
            self.resident.put(page_id, Resident { page, dirty: false });
            access.loaded = true;
        }

        let resident = match self.resident.get_mut(&page_id) {
            Some(resident) => resident,
            None => {
                return Err(EmberError::Storage(format!(
                    "index page {} vanished from the cache",
                    page_id
                )))
            }
        };
        resident.dirty |= dirty;
        Ok((&mut resident.page, access))
    }

    /// Write back every dirty page
    pub(crate) fn flush(&mut self, store: &PageStore) -> Result<usize> {
        let mut written = 0;
        for (id, resident) in self.resident.iter_mut() {
            if resident.dirty {
                store.store(*id, &resident.page)?;
                resident.dirty = false;
                written += 1;
            }
        }
        Ok(written)
    }

    /// Drop every resident page without writing anything back
    pub(crate) fn reset(&mut self) {
        self.resident.clear();
    }

    /// Write back the least recently used page, then drop it
    fn evict_one(&mut self, store: &PageStore) -> Result<()> {
        let Some((&victim, resident)) = self.resident.peek_lru() else {
            return Ok(());
        };
        // A failed write-back leaves the page resident and dirty
        if resident.dirty {
            store.store(victim, &resident.page)?;
        }
        self.resident.pop_lru();
        tracing::trace!("Evicted index page {}", victim);
        Ok(())
    }
}
