//! Caller-facing entry types

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::log::{Record, NO_EXPIRY};

/// A key/value pair as the host cache hands it to the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: Bytes,
    pub value: Bytes,
    /// Opaque blob (see [`Metadata`] for the usual encoding)
    pub metadata: Option<Bytes>,
    /// Absolute expiry in millis, `-1` for never
    pub expiry: i64,
    pub cache_segment: u32,
}

impl Entry {
    pub fn new(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            metadata: None,
            expiry: NO_EXPIRY,
            cache_segment: 0,
        }
    }

    pub fn with_metadata(mut self, metadata: impl Into<Bytes>) -> Self {
        let metadata = metadata.into();
        self.metadata = (!metadata.is_empty()).then_some(metadata);
        self
    }

    pub fn with_expiry(mut self, expiry: i64) -> Self {
        self.expiry = expiry;
        self
    }

    pub fn in_segment(mut self, cache_segment: u32) -> Self {
        self.cache_segment = cache_segment;
        self
    }

    /// Value entry for a record, `None` for tombstones
    pub(crate) fn from_record(record: Record) -> Option<Self> {
        Some(Self {
            value: record.value?,
            key: record.key,
            metadata: record.metadata,
            expiry: record.expiry,
            cache_segment: record.cache_segment,
        })
    }
}

impl From<Entry> for Record {
    fn from(entry: Entry) -> Self {
        Record {
            key: entry.key,
            value: Some(entry.value),
            metadata: entry.metadata,
            expiry: entry.expiry,
            cache_segment: entry.cache_segment,
        }
    }
}

/// An entry produced by iteration; value and metadata are only present when
/// requested
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedEntry {
    pub key: Bytes,
    pub value: Option<Bytes>,
    pub metadata: Option<Bytes>,
    pub expiry: i64,
    pub cache_segment: u32,
}

// =============================================================================
// Iteration Options
// =============================================================================

pub type KeyFilter = Arc<dyn Fn(&[u8]) -> bool + Send + Sync>;

/// What [`StoreEngine::iterate`](super::StoreEngine::iterate) should yield
#[derive(Clone)]
pub struct IterateOptions {
    /// Only entries in these cache segments (all when `None`)
    pub segments: Option<HashSet<u32>>,
    pub key_filter: Option<KeyFilter>,
    pub fetch_value: bool,
    pub fetch_metadata: bool,
}

impl Default for IterateOptions {
    fn default() -> Self {
        Self {
            segments: None,
            key_filter: None,
            fetch_value: true,
            fetch_metadata: true,
        }
    }
}

impl IterateOptions {
    /// Keys only
    pub fn keys() -> Self {
        Self {
            fetch_value: false,
            fetch_metadata: false,
            ..Self::default()
        }
    }

    pub fn segments(mut self, segments: impl IntoIterator<Item = u32>) -> Self {
        self.segments = Some(segments.into_iter().collect());
        self
    }

    pub fn key_filter(mut self, filter: impl Fn(&[u8]) -> bool + Send + Sync + 'static) -> Self {
        self.key_filter = Some(Arc::new(filter));
        self
    }

    pub fn fetch_value(mut self, fetch: bool) -> Self {
        self.fetch_value = fetch;
        self
    }

    pub fn fetch_metadata(mut self, fetch: bool) -> Self {
        self.fetch_metadata = fetch;
        self
    }

    pub(crate) fn wants_segment(&self, cache_segment: u32) -> bool {
        self.segments
            .as_ref()
            .map_or(true, |segments| segments.contains(&cache_segment))
    }

    pub(crate) fn wants_key(&self, key: &[u8]) -> bool {
        self.key_filter.as_ref().map_or(true, |filter| filter(key))
    }
}

impl fmt::Debug for IterateOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IterateOptions")
            .field("segments", &self.segments)
            .field("key_filter", &self.key_filter.is_some())
            .field("fetch_value", &self.fetch_value)
            .field("fetch_metadata", &self.fetch_metadata)
            .finish()
    }
}

// =============================================================================
// Metadata
// =============================================================================

/// Conventional contents of the opaque metadata blob
///
/// The store never decodes this; hosts that want lifespan/idle bookkeeping
/// encode it here and derive the record expiry with [`Metadata::expiry_at`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    /// `-1` for immortal
    pub lifespan_ms: i64,
    /// `-1` for no idle limit
    pub max_idle_ms: i64,
    pub created_ms: i64,
    pub last_used_ms: i64,
    /// Host-specific bytes carried along untouched
    pub internal: Vec<u8>,
}

impl Metadata {
    pub fn new(created_ms: i64) -> Self {
        Self {
            lifespan_ms: -1,
            max_idle_ms: -1,
            created_ms,
            last_used_ms: created_ms,
            internal: Vec::new(),
        }
    }

    pub fn with_lifespan(mut self, lifespan_ms: i64) -> Self {
        self.lifespan_ms = lifespan_ms;
        self
    }

    pub fn with_max_idle(mut self, max_idle_ms: i64) -> Self {
        self.max_idle_ms = max_idle_ms;
        self
    }

    /// Absolute expiry implied by lifespan and idle limit, `-1` for never
    pub fn expiry_at(&self) -> i64 {
        let lifespan = (self.lifespan_ms >= 0).then(|| self.created_ms + self.lifespan_ms);
        let idle = (self.max_idle_ms >= 0).then(|| self.last_used_ms + self.max_idle_ms);
        match (lifespan, idle) {
            (Some(a), Some(b)) => a.min(b),
            (Some(a), None) | (None, Some(a)) => a,
            (None, None) => NO_EXPIRY,
        }
    }

    pub fn to_bytes(&self) -> Result<Bytes> {
        Ok(Bytes::from(bincode::serialize(self)?))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}
