//! Backend registry: selector → pool with round-robin selection.
//!
//! Backends are registered at runtime through the control plane and
//! consumed by the forwarders on every connection or request. Each
//! selector owns one pool; the pool keeps its backends in insertion order
//! and colocates the round-robin cursor, so a selection can never observe
//! a cursor that belongs to a different generation of the pool.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;

/// Errors surfaced by registry operations.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    /// The selector was empty.
    #[error("selector must not be empty")]
    EmptySelector,
    /// The backend address was empty.
    #[error("backend address must not be empty")]
    EmptyBackend,
    /// No backend is registered for the selector.
    #[error("no backend available for selector '{0}'")]
    NoBackend(String),
}

/// One selector's backend pool together with its round-robin cursor.
///
/// The cursor is a monotonically increasing counter; the selected index is
/// the counter taken modulo the pool length observed under the read guard.
/// That keeps the pick inside the pool snapshot it was made against, and a
/// single-threaded caller cycles through the pool in insertion order with
/// period `len`.
struct Pool {
    backends: RwLock<Vec<String>>,
    cursor: AtomicUsize,
}

impl Pool {
    fn new() -> Self {
        Self {
            backends: RwLock::new(Vec::new()),
            cursor: AtomicUsize::new(0),
        }
    }
}

/// Thread-safe mapping from hostname selector to backend pool.
///
/// `next` and `register` run concurrently from many connection workers;
/// mutations are serialized per selector by the pool's own lock, and
/// operations on distinct selectors are independent.
pub struct Registry {
    pools: RwLock<HashMap<String, Arc<Pool>>>,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            pools: RwLock::new(HashMap::new()),
        }
    }

    /// Register a backend for a selector, creating the pool if absent.
    ///
    /// Registration is idempotent: re-registering an existing
    /// `(selector, backend)` pair leaves the pool unchanged.
    pub async fn register(
        &self,
        selector: &str,
        backend: &str,
    ) -> Result<(), RegistryError> {
        if selector.is_empty() {
            return Err(RegistryError::EmptySelector);
        }
        if backend.is_empty() {
            return Err(RegistryError::EmptyBackend);
        }

        let pool = self.get_or_create_pool(selector).await;
        let mut backends = pool.backends.write().await;
        if !backends.iter().any(|b| b == backend) {
            backends.push(backend.to_string());
            debug!(
                selector = selector,
                backend = backend,
                pool_size = backends.len(),
                "Backend registered"
            );
        }
        Ok(())
    }

    /// Remove a backend from a selector's pool.
    ///
    /// The cursor is clamped modulo the new pool size so the next selection
    /// continues from an in-range position. When the pool empties, the
    /// selector entry is removed entirely.
    pub async fn deregister(&self, selector: &str, backend: &str) {
        let mut pools = self.pools.write().await;
        let Some(pool) = pools.get(selector) else {
            return;
        };

        let now_empty = {
            let mut backends = pool.backends.write().await;
            backends.retain(|b| b != backend);
            let len = backends.len();
            if len > 0 {
                let cursor = pool.cursor.load(Ordering::Relaxed);
                pool.cursor.store(cursor % len, Ordering::Relaxed);
            }
            len == 0
        };

        if now_empty {
            pools.remove(selector);
        }
        debug!(selector = selector, backend = backend, "Backend deregistered");
    }

    /// Return the next backend for a selector in round-robin order.
    pub async fn next(&self, selector: &str) -> Result<String, RegistryError> {
        let pool = {
            let pools = self.pools.read().await;
            pools
                .get(selector)
                .cloned()
                .ok_or_else(|| RegistryError::NoBackend(selector.to_string()))?
        };

        let backends = pool.backends.read().await;
        if backends.is_empty() {
            return Err(RegistryError::NoBackend(selector.to_string()));
        }
        let idx = pool.cursor.fetch_add(1, Ordering::Relaxed) % backends.len();
        Ok(backends[idx].clone())
    }

    /// Number of backends currently registered for a selector.
    pub async fn pool_size(&self, selector: &str) -> usize {
        let pool = {
            let pools = self.pools.read().await;
            pools.get(selector).cloned()
        };
        match pool {
            Some(pool) => pool.backends.read().await.len(),
            None => 0,
        }
    }

    /// All selectors with a registered pool.
    pub async fn selectors(&self) -> Vec<String> {
        let pools = self.pools.read().await;
        pools.keys().cloned().collect()
    }

    async fn get_or_create_pool(&self, selector: &str) -> Arc<Pool> {
        // Fast path: read lock
        {
            let pools = self.pools.read().await;
            if let Some(pool) = pools.get(selector) {
                return Arc::clone(pool);
            }
        }

        // Slow path: write lock
        let mut pools = self.pools.write().await;
        pools
            .entry(selector.to_string())
            .or_insert_with(|| Arc::new(Pool::new()))
            .clone()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
