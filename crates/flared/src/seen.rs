//! Bounded duplicate-suppression memory for alert identifiers.

use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Mutex, PoisonError};

/// Default capacity of the seen-id set.
pub const DEFAULT_SEEN_CAPACITY: usize = 4096;

/// Set of alert ids this node has already processed.
///
/// Bounded: once `capacity` ids are remembered the oldest entry is evicted
/// on every new insertion. Lookups never refresh an entry, so eviction
/// order is exactly insertion order. Safe to probe from multiple tasks.
#[derive(Debug)]
pub struct SeenSet {
    inner: Mutex<LruCache<String, ()>>,
}

impl SeenSet {
    /// Creates a set bounded to `capacity` ids. A zero capacity is clamped
    /// to one.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Records `id`, returning `true` iff it was not already present.
    pub fn insert(&self, id: &str) -> bool {
        let mut seen = self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if seen.contains(id) {
            return false;
        }
        seen.put(id.to_owned(), ());
        true
    }

    /// Number of ids currently remembered.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Returns `true` if no ids are remembered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forgets every remembered id.
    pub fn clear(&self) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl Default for SeenSet {
    fn default() -> Self {
        Self::new(DEFAULT_SEEN_CAPACITY)
    }
}
