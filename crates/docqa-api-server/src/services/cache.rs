use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Bounded concurrent cache with TTL and LRU eviction. Entries are
/// immutable once written. Backs both the answer cache and the
/// embedding cache.
pub struct TtlLruCache<V: Clone> {
    storage: Arc<DashMap<String, Entry<V>>>,
    ttl: Duration,
    max_entries: usize,
    /// Logical clock for LRU ordering; bumped on every access.
    clock: AtomicU64,
}

struct Entry<V> {
    value: V,
    inserted_at: Instant,
    last_used: AtomicU64,
}

impl<V: Clone> TtlLruCache<V> {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            storage: Arc::new(DashMap::new()),
            ttl,
            max_entries: max_entries.max(1),
            clock: AtomicU64::new(0),
        }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let entry = self.storage.get(key)?;

        // Lazy expiration
        if entry.inserted_at.elapsed() > self.ttl {
            drop(entry);
            self.storage.remove(key);
            debug!(key, "cache entry expired");
            return None;
        }

        let tick = self.clock.fetch_add(1, Ordering::Relaxed);
        entry.last_used.store(tick, Ordering::Relaxed);
        Some(entry.value.clone())
    }

    pub fn insert(&self, key: String, value: V) {
        let tick = self.clock.fetch_add(1, Ordering::Relaxed);
        self.storage.insert(
            key,
            Entry {
                value,
                inserted_at: Instant::now(),
                last_used: AtomicU64::new(tick),
            },
        );

        if self.storage.len() > self.max_entries {
            self.evict_lru();
        }
    }

    /// Remove the least-recently-used entry. Linear scan; the map is
    /// bounded so this stays cheap relative to a pipeline request.
    fn evict_lru(&self) {
        let mut oldest_key: Option<String> = None;
        let mut oldest_tick = u64::MAX;

        for entry in self.storage.iter() {
            let tick = entry.value().last_used.load(Ordering::Relaxed);
            if tick < oldest_tick {
                oldest_tick = tick;
                oldest_key = Some(entry.key().clone());
            }
        }

        if let Some(key) = oldest_key {
            self.storage.remove(&key);
            debug!(key, "evicted LRU cache entry");
        }
    }

    pub fn len(&self) -> usize {
        self.storage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    pub fn clear(&self) {
        self.storage.clear();
    }
}

/// Stable cache key from the concatenated parts.
pub fn cache_key(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_get() {
        let cache: TtlLruCache<String> = TtlLruCache::new(Duration::from_secs(60), 10);
        cache.insert("k".to_string(), "v".to_string());
        assert_eq!(cache.get("k"), Some("v".to_string()));
        assert_eq!(cache.get("missing"), None);
    }

    #[test]
    fn test_ttl_expiry() {
        let cache: TtlLruCache<u32> = TtlLruCache::new(Duration::from_millis(0), 10);
        cache.insert("k".to_string(), 1);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.get("k"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_lru_eviction() {
        let cache: TtlLruCache<u32> = TtlLruCache::new(Duration::from_secs(60), 2);
        cache.insert("a".to_string(), 1);
        cache.insert("b".to_string(), 2);

        // Touch "a" so "b" becomes the LRU entry
        assert_eq!(cache.get("a"), Some(1));

        cache.insert("c".to_string(), 3);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("b"), None);
        assert_eq!(cache.get("a"), Some(1));
        assert_eq!(cache.get("c"), Some(3));
    }

    #[test]
    fn test_cache_key_is_stable_and_distinct() {
        let a = cache_key(&["query", "hybrid", "10"]);
        let b = cache_key(&["query", "hybrid", "10"]);
        let c = cache_key(&["query", "hybrid", "11"]);
        assert_eq!(a, b);
        assert_ne!(a, c);

        // Separator prevents ambiguous concatenation
        let d = cache_key(&["ab", "c"]);
        let e = cache_key(&["a", "bc"]);
        assert_ne!(d, e);
    }
}
