//! Byte-bounded LRU cache over decoded chunk planes.
//!
//! Keys are tile coordinates, values are shared decoded planes. Capacity is
//! a byte budget rather than an entry count; eviction is strictly
//! least-recently-used by last `get`/`put`, and the evict-and-insert section
//! is a single critical section so the budget is never observably exceeded.

use lru::LruCache;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

use crate::types::{DEFAULT_CACHE_BYTES, TileCoord};

struct CacheInner {
    map: LruCache<TileCoord, Arc<Vec<u8>>>,
    bytes: usize,
}

/// Byte-bounded strict-LRU chunk cache.
pub struct ChunkCache {
    inner: Mutex<CacheInner>,
    max_bytes: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

/// Point-in-time cache statistics.
#[derive(Debug, Clone)]
pub struct CacheStats {
    /// Bytes currently held
    pub bytes: usize,
    /// Configured byte budget
    pub max_bytes: usize,
    /// Number of cached planes
    pub entries: usize,
    /// Lifetime hit count
    pub hits: u64,
    /// Lifetime miss count
    pub misses: u64,
    /// Lifetime eviction count
    pub evictions: u64,
}

impl ChunkCache {
    /// Create a cache with the default 256 MiB budget.
    pub fn new() -> Self {
        Self::with_max_bytes(DEFAULT_CACHE_BYTES)
    }

    /// Create a cache with a custom byte budget.
    pub fn with_max_bytes(max_bytes: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner { map: LruCache::unbounded(), bytes: 0 }),
            max_bytes,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Look up a plane, updating its recency.
    pub fn get(&self, coord: &TileCoord) -> Option<Arc<Vec<u8>>> {
        let mut inner = self.inner.lock();
        match inner.map.get(coord) {
            Some(plane) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(Arc::clone(plane))
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Insert a plane, evicting least-recently-used entries to stay inside
    /// the byte budget.
    pub fn put(&self, coord: TileCoord, plane: Arc<Vec<u8>>) {
        let size = plane.len();
        if size > self.max_bytes {
            warn!("Refusing to cache {coord}: {size} bytes exceeds the whole budget");
            return;
        }

        let mut inner = self.inner.lock();
        if let Some(previous) = inner.map.put(coord, plane) {
            inner.bytes -= previous.len();
        }
        inner.bytes += size;

        while inner.bytes > self.max_bytes {
            match inner.map.pop_lru() {
                Some((evicted, evicted_plane)) => {
                    inner.bytes -= evicted_plane.len();
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                    debug!("Evicted {evicted} ({} bytes)", evicted_plane.len());
                }
                None => break,
            }
        }
    }

    /// Bytes currently held.
    pub fn len_bytes(&self) -> usize {
        self.inner.lock().bytes
    }

    /// Number of cached planes.
    pub fn entry_count(&self) -> usize {
        self.inner.lock().map.len()
    }

    /// Drop every entry.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.map.clear();
        inner.bytes = 0;
    }

    /// Snapshot of cache statistics.
    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            bytes: inner.bytes,
            max_bytes: self.max_bytes,
            entries: inner.map.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

impl Default for ChunkCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChannelId;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn coord(n: u32) -> TileCoord {
        TileCoord {
            dataset: "ds".to_string(),
            timestamp: "t".to_string(),
            channel: ChannelId::BrightField,
            scale: 0,
            x: n,
            y: 0,
        }
    }

    fn plane(fill: u8, len: usize) -> Arc<Vec<u8>> {
        Arc::new(vec![fill; len])
    }

    #[test]
    fn test_put_then_get_returns_same_bytes() {
        let cache = ChunkCache::with_max_bytes(1024);
        let data = plane(3, 100);
        cache.put(coord(1), Arc::clone(&data));
        let out = cache.get(&coord(1)).unwrap();
        assert!(Arc::ptr_eq(&data, &out));
        assert_eq!(cache.len_bytes(), 100);
    }

    #[test]
    fn test_eviction_is_strict_lru() {
        let cache = ChunkCache::with_max_bytes(300);
        cache.put(coord(1), plane(1, 100));
        cache.put(coord(2), plane(2, 100));
        cache.put(coord(3), plane(3, 100));

        // Touch 1 so 2 becomes the oldest.
        cache.get(&coord(1)).unwrap();
        cache.put(coord(4), plane(4, 100));

        assert!(cache.get(&coord(2)).is_none());
        assert!(cache.get(&coord(1)).is_some());
        assert!(cache.get(&coord(3)).is_some());
        assert!(cache.get(&coord(4)).is_some());
        assert_eq!(cache.len_bytes(), 300);
    }

    #[test]
    fn test_replacing_a_key_adjusts_accounting() {
        let cache = ChunkCache::with_max_bytes(1000);
        cache.put(coord(1), plane(1, 400));
        cache.put(coord(1), plane(2, 100));
        assert_eq!(cache.len_bytes(), 100);
        assert_eq!(cache.entry_count(), 1);
    }

    #[test]
    fn test_oversized_entry_is_refused() {
        let cache = ChunkCache::with_max_bytes(64);
        cache.put(coord(1), plane(1, 128));
        assert_eq!(cache.entry_count(), 0);
        assert_eq!(cache.len_bytes(), 0);
    }

    #[test]
    fn test_stats_track_hits_and_misses() {
        let cache = ChunkCache::with_max_bytes(1024);
        cache.put(coord(1), plane(1, 10));
        cache.get(&coord(1));
        cache.get(&coord(2));
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));
        assert_eq!(stats.entries, 1);
    }

    proptest! {
        /// The byte budget holds at every observable instant, whatever the
        /// interleaving of inserts and lookups.
        #[test]
        fn prop_capacity_never_exceeded(
            ops in proptest::collection::vec((0u32..64, 1usize..512, any::<bool>()), 1..200)
        ) {
            let cache = ChunkCache::with_max_bytes(2048);
            for (n, len, is_put) in ops {
                if is_put {
                    cache.put(coord(n), plane(n as u8, len));
                } else {
                    cache.get(&coord(n));
                }
                prop_assert!(cache.len_bytes() <= 2048);
            }
        }

        /// A cached plane survives lookups of other keys while capacity
        /// allows, and comes back byte-identical.
        #[test]
        fn prop_present_key_roundtrips(fills in proptest::collection::vec(any::<u8>(), 1..32)) {
            let cache = ChunkCache::with_max_bytes(1 << 20);
            for (i, fill) in fills.iter().enumerate() {
                cache.put(coord(i as u32), plane(*fill, 64));
            }
            for (i, fill) in fills.iter().enumerate() {
                let out = cache.get(&coord(i as u32)).unwrap();
                let expected = vec![*fill; 64];
                prop_assert_eq!(out.as_slice(), expected.as_slice());
            }
        }
    }
}
