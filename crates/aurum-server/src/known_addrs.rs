//! Bounded cache of addresses known to a peer.

use lru::LruCache;
use std::num::NonZeroUsize;

/// LRU cache of address keys used to suppress duplicate address gossip to
/// and from a single peer.
#[derive(Debug)]
pub struct KnownAddressCache {
    cache: LruCache<String, ()>,
}

impl KnownAddressCache {
    /// New cache holding at most `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: LruCache::new(capacity),
        }
    }

    /// Record an address key, evicting the least recently used entry when
    /// full. Inserting an existing key only refreshes its recency.
    pub fn insert(&mut self, key: String) {
        self.cache.put(key, ());
    }

    /// Whether the key is present. Does not refresh recency.
    pub fn contains(&self, key: &str) -> bool {
        self.cache.contains(key)
    }

    /// Number of cached keys.
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}
