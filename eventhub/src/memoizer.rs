use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use moka::future::Cache;

use crate::error::EventHubError;

/// Key-addressed store with an atomic get-or-create.
///
/// Uses moka's `try_get_with` for per-key coalescing:
/// - If present: returns the cached value without running the initializer
/// - If absent: only one caller runs the initializer, concurrent callers for the
///   same key wait for its result
/// - Different keys initialize in parallel
///
/// Entries never expire. A failed initialization is not cached, so the next caller
/// retries it.
pub struct Memoizer<K, V> {
    cache: Cache<K, V>,
}

impl<K, V> Memoizer<K, V>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            cache: Cache::builder().build(),
        }
    }

    pub async fn get_or_try_init<F>(&self, key: K, init: F) -> Result<V, EventHubError>
    where
        F: Future<Output = Result<V, EventHubError>>,
    {
        self.cache
            .try_get_with(key, init)
            .await
            .map_err(|err: Arc<EventHubError>| (*err).clone())
    }

    pub async fn get(&self, key: &K) -> Option<V> {
        self.cache.get(key).await
    }

    /// Snapshot of every cached value.
    pub fn values(&self) -> Vec<V> {
        self.cache.iter().map(|(_, value)| value).collect()
    }

    pub async fn clear(&self) {
        self.cache.invalidate_all();
        self.cache.run_pending_tasks().await;
    }

    pub fn len(&self) -> usize {
        self.values().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K, V> Default for Memoizer<K, V>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
