//! Selector-keyed response cache.
//!
//! The L7 forwarder records full upstream response bodies here and serves
//! later identical requests without another upstream round trip. The cache
//! is deliberately demo-grade: no TTL, no invalidation, and unbounded
//! unless a byte capacity is configured.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use bytes::Bytes;
use dashmap::DashMap;
use tracing::debug;

/// Pluggable cache interface used by the forwarders.
///
/// Concurrent `put`s on one key may race; the observed value is always one
/// of the values written (last writer wins).
pub trait ResponseCache: Send + Sync {
    /// Look up a cached response body.
    fn get(&self, key: &str) -> Option<Bytes>;
    /// Record a response body under a key.
    fn put(&self, key: &str, body: Bytes);
}

/// In-memory cache on a sharded concurrent map.
///
/// Unbounded by default. With [`MemoryCache::with_max_bytes`] the cache
/// evicts oldest-inserted entries until a new entry fits; entries larger
/// than the whole cap are dropped without being stored.
pub struct MemoryCache {
    entries: DashMap<String, Bytes>,
    // Insertion order, one slot per distinct key, used for eviction.
    order: Mutex<VecDeque<String>>,
    used_bytes: AtomicUsize,
    max_bytes: Option<usize>,
}

impl MemoryCache {
    /// Create an unbounded cache.
    pub fn unbounded() -> Self {
        Self {
            entries: DashMap::new(),
            order: Mutex::new(VecDeque::new()),
            used_bytes: AtomicUsize::new(0),
            max_bytes: None,
        }
    }

    /// Create a cache that holds at most `max_bytes` of body data.
    pub fn with_max_bytes(max_bytes: usize) -> Self {
        Self {
            entries: DashMap::new(),
            order: Mutex::new(VecDeque::new()),
            used_bytes: AtomicUsize::new(0),
            max_bytes: Some(max_bytes),
        }
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total bytes of cached body data.
    pub fn used_bytes(&self) -> usize {
        self.used_bytes.load(Ordering::Relaxed)
    }

    fn evict_until_fits(&self, incoming: usize, cap: usize) {
        let mut order = self.order.lock().expect("cache order lock poisoned");
        while self.used_bytes.load(Ordering::Relaxed) + incoming > cap {
            let Some(victim) = order.pop_front() else {
                break;
            };
            if let Some((_, body)) = self.entries.remove(&victim) {
                self.used_bytes.fetch_sub(body.len(), Ordering::Relaxed);
                debug!(key = %victim, bytes = body.len(), "Cache entry evicted");
            }
        }
    }
}

impl ResponseCache for MemoryCache {
    fn get(&self, key: &str) -> Option<Bytes> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    fn put(&self, key: &str, body: Bytes) {
        if let Some(cap) = self.max_bytes {
            if body.len() > cap {
                debug!(key = key, bytes = body.len(), "Response larger than cache cap, not stored");
                return;
            }
            self.evict_until_fits(body.len(), cap);
        }

        let new_len = body.len();
        match self.entries.insert(key.to_string(), body) {
            Some(old) => {
                // Replacement: key keeps its original slot in the order queue.
                self.used_bytes.fetch_sub(old.len(), Ordering::Relaxed);
            }
            None => {
                let mut order = self.order.lock().expect("cache order lock poisoned");
                order.push_back(key.to_string());
            }
        }
        self.used_bytes.fetch_add(new_len, Ordering::Relaxed);
    }
}
