//! LRU cache of small, recently read payloads.

use crate::types::{BlobType, Key};
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Cached payload, tagged with the generation it was read at.
#[derive(Clone)]
struct CachedRecord {
    generation: u64,
    data: Arc<Vec<u8>>,
}

/// Read cache keyed by (key, type).
pub struct ReadCache {
    /// `None` when caching is disabled.
    cache: Option<Mutex<LruCache<(Key, BlobType), CachedRecord>>>,

    /// Payloads larger than this are never cached.
    max_record_size: u64,

    hits: AtomicU64,
    misses: AtomicU64,
}

impl ReadCache {
    /// Create a cache holding up to `capacity` records. Zero disables it.
    pub fn new(capacity: usize, max_record_size: u64) -> Self {
        Self {
            cache: NonZeroUsize::new(capacity).map(|cap| Mutex::new(LruCache::new(cap))),
            max_record_size,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Whether a payload of `size` bytes is worth caching.
    pub fn admits(&self, size: u64) -> bool {
        self.cache.is_some() && size <= self.max_record_size
    }

    /// Cached payload for (key, type), if it is still the given generation.
    pub fn get(&self, key: &Key, blob_type: BlobType, generation: u64) -> Option<Arc<Vec<u8>>> {
        let cache = self.cache.as_ref()?;
        let found = cache
            .lock()
            .get(&(*key, blob_type))
            .filter(|cached| cached.generation == generation)
            .map(|cached| Arc::clone(&cached.data));

        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    pub fn put(&self, key: Key, blob_type: BlobType, generation: u64, data: Arc<Vec<u8>>) {
        if let Some(cache) = &self.cache {
            cache
                .lock()
                .put((key, blob_type), CachedRecord { generation, data });
        }
    }

    pub fn invalidate(&self, key: &Key, blob_type: BlobType) {
        if let Some(cache) = &self.cache {
            cache.lock().pop(&(*key, blob_type));
        }
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}
