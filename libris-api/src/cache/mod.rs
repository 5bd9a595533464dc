//! Fixed-capacity LRU cache for book-availability reads.
//!
//! Read handlers consult this cache before touching the pool; the batch
//! workers invalidate an ISBN whenever they mutate its row, so a read
//! after a confirmed reservation always sees the database value. Eviction
//! is strictly least-recently-used by last get/put. No TTL.

mod metrics;

pub use metrics::{CacheMetrics, CacheStats};

use std::num::NonZeroUsize;

use lru::LruCache;
use tokio::sync::RwLock;

use crate::model::Book;

/// Shared, capacity-bounded ISBN → book cache.
pub struct BookCache {
    inner: RwLock<LruCache<String, Book>>,
    metrics: CacheMetrics,
    capacity: usize,
}

impl BookCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: RwLock::new(LruCache::new(NonZeroUsize::new(capacity).unwrap())),
            metrics: CacheMetrics::new(),
            capacity,
        }
    }

    /// Look up a book. A hit promotes the entry to most-recently-used,
    /// so this takes the write lock.
    pub async fn get(&self, isbn: &str) -> Option<Book> {
        let mut inner = self.inner.write().await;
        match inner.get(isbn) {
            Some(book) => {
                self.metrics.record_hit();
                Some(book.clone())
            }
            None => {
                self.metrics.record_miss();
                None
            }
        }
    }

    /// Insert or refresh an entry, evicting the least-recently-used
    /// entry when at capacity.
    pub async fn put(&self, isbn: String, book: Book) {
        let mut inner = self.inner.write().await;
        inner.put(isbn, book);
        self.metrics.record_put();
    }

    /// Drop an entry if present. Idempotent.
    pub async fn invalidate(&self, isbn: &str) {
        let mut inner = self.inner.write().await;
        if inner.pop(isbn).is_some() {
            self.metrics.record_invalidation();
        }
    }

    /// Drop every entry.
    pub async fn clear(&self) {
        let mut inner = self.inner.write().await;
        inner.clear();
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn stats(&self) -> CacheStats {
        let size = self.inner.read().await.len();
        self.metrics.snapshot(size, self.capacity)
    }
}
