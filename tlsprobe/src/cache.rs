//! Negative result cache
//!
//! Remembers binaries whose analysis failed for content reasons so they are
//! not analyzed again every time a process runs them. Losing an entry only
//! costs one more analysis.

use std::num::NonZeroUsize;
use std::sync::{Mutex, PoisonError};

use lru::LruCache;

use crate::domain::BinaryId;

/// Bounded LRU set of binary identities not worth analyzing
#[derive(Debug)]
pub struct NegativeCache {
    // None when the cache is disabled (capacity 0)
    inner: Option<Mutex<LruCache<BinaryId, ()>>>,
}

impl NegativeCache {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self { inner: NonZeroUsize::new(capacity).map(|cap| Mutex::new(LruCache::new(cap))) }
    }

    /// Check for `id`, refreshing its recency on a hit
    #[must_use]
    pub fn contains(&self, id: &BinaryId) -> bool {
        self.inner.as_ref().is_some_and(|cache| {
            cache.lock().unwrap_or_else(PoisonError::into_inner).get(id).is_some()
        })
    }

    /// Remember `id`, evicting the least recently used entry when full
    pub fn add(&self, id: BinaryId) {
        if let Some(cache) = &self.inner {
            cache.lock().unwrap_or_else(PoisonError::into_inner).put(id, ());
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner
            .as_ref()
            .map_or(0, |cache| cache.lock().unwrap_or_else(PoisonError::into_inner).len())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_contains() {
        let cache = NegativeCache::new(4);
        let id = BinaryId::new(8, 200);
        assert!(!cache.contains(&id));
        cache.add(id);
        assert!(cache.contains(&id));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_evicts_least_recently_used() {
        let cache = NegativeCache::new(2);
        let (a, b, c) = (BinaryId::new(1, 1), BinaryId::new(1, 2), BinaryId::new(1, 3));
        cache.add(a);
        cache.add(b);
        // touch a so b becomes the eviction candidate
        assert!(cache.contains(&a));
        cache.add(c);
        assert!(cache.contains(&a));
        assert!(!cache.contains(&b));
        assert!(cache.contains(&c));
    }

    #[test]
    fn test_zero_capacity_disables() {
        let cache = NegativeCache::new(0);
        cache.add(BinaryId::new(8, 200));
        assert!(!cache.contains(&BinaryId::new(8, 200)));
        assert!(cache.is_empty());
    }
}
