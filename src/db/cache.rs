use std::any::Any;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;

use crate::types::Address;

/// Key of a derived result: the producer's namespace, the record it was
/// derived from, and a producer-chosen discriminator (typically a hash of the
/// query).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ResultKey {
    namespace: &'static str,
    address: Address,
    discriminator: u64,
}

impl ResultKey {
    /// Builds a key.
    pub fn new(namespace: &'static str, address: Address, discriminator: u64) -> Self {
        Self {
            namespace,
            address,
            discriminator,
        }
    }
}

type Entry = Arc<dyn Any + Send + Sync>;

/// LRU of derived results, dropped wholesale whenever a lock is released.
pub(crate) struct ResultCache {
    entries: Mutex<LruCache<ResultKey, Entry>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ResultCache {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN),
            )),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub(crate) fn get<T: Any + Send + Sync>(&self, key: &ResultKey) -> Option<Arc<T>> {
        let entry = self.entries.lock().get(key).cloned();
        match entry.and_then(|entry| entry.downcast::<T>().ok()) {
            Some(hit) => {
                self.hits.fetch_add(1, AtomicOrdering::Relaxed);
                Some(hit)
            }
            None => {
                self.misses.fetch_add(1, AtomicOrdering::Relaxed);
                None
            }
        }
    }

    pub(crate) fn put<T: Any + Send + Sync>(&self, key: ResultKey, value: Arc<T>) {
        self.entries.lock().put(key, value);
    }

    pub(crate) fn clear(&self) {
        self.entries.lock().clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// `(hits, misses)` since the handle was opened.
    pub(crate) fn counters(&self) -> (u64, u64) {
        (
            self.hits.load(AtomicOrdering::Relaxed),
            self.misses.load(AtomicOrdering::Relaxed),
        )
    }
}
