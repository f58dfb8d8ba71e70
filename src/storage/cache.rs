//! Bounded Key/Value Cache
//!
//! Sessions and search totals are cached through the small [`Cache`] trait:
//! callers only ever `get`, `put` and `delete`. The in-process
//! implementation, [`LruStore`], evicts the least recently used entry once
//! its capacity is reached and is safe to share between the event loop and
//! pool threads.

use lru::LruCache;
use parking_lot::Mutex;
use std::hash::Hash;
use std::num::NonZeroUsize;

/// A capacity-bounded key/value cache.
pub trait Cache<K, V>: Send + Sync {
    /// Returns a copy of the cached value and marks it recently used.
    fn get(&self, key: &K) -> Option<V>;

    /// Inserts or replaces a value, evicting the oldest entry if full.
    fn put(&self, key: K, value: V);

    /// Removes a value, returning it if present.
    fn delete(&self, key: &K) -> Option<V>;
}

/// LRU cache behind a mutex.
pub struct LruStore<K: Hash + Eq, V> {
    inner: Mutex<LruCache<K, V>>,
}

impl<K: Hash + Eq, V> LruStore<K, V> {
    /// Creates a cache holding at most `capacity` entries (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

impl<K, V> Cache<K, V> for LruStore<K, V>
where
    K: Hash + Eq + Send,
    V: Clone + Send,
{
    fn get(&self, key: &K) -> Option<V> {
        self.inner.lock().get(key).cloned()
    }

    fn put(&self, key: K, value: V) {
        self.inner.lock().put(key, value);
    }

    fn delete(&self, key: &K) -> Option<V> {
        self.inner.lock().pop(key)
    }
}

impl<K: Hash + Eq, V> std::fmt::Debug for LruStore<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("LruStore")
            .field("len", &inner.len())
            .field("capacity", &inner.cap())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_put_delete() {
        let cache: LruStore<String, u32> = LruStore::new(4);
        cache.put("a".into(), 1);
        assert_eq!(cache.get(&"a".to_string()), Some(1));
        assert_eq!(cache.delete(&"a".to_string()), Some(1));
        assert_eq!(cache.get(&"a".to_string()), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_evicts_least_recently_used() {
        let cache: LruStore<u32, u32> = LruStore::new(2);
        cache.put(1, 10);
        cache.put(2, 20);
        // touch 1 so that 2 becomes the eviction candidate
        assert_eq!(cache.get(&1), Some(10));
        cache.put(3, 30);

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&2), None);
        assert_eq!(cache.get(&1), Some(10));
        assert_eq!(cache.get(&3), Some(30));
    }

    #[test]
    fn test_zero_capacity_holds_one() {
        let cache: LruStore<u32, u32> = LruStore::new(0);
        cache.put(1, 1);
        cache.put(2, 2);
        assert_eq!(cache.len(), 1);
    }
}
