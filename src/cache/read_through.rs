use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use super::lru::LruCache;
use crate::persistence::{PersistenceError, StatePersistenceAdapter, UpdateEvent};

/// Memoizes persisted values in an [`LruCache`]
///
/// Cached entries are dropped when the adapter reports a change to their key
/// (or a clear), once [`start_invalidation`](Self::start_invalidation) is
/// running. Absent keys are not cached.
pub struct CachedStateReader {
    adapter: Arc<dyn StatePersistenceAdapter>,
    cache: Arc<LruCache<String, Value>>,
    /// Bumped on every invalidation so a read racing a write cannot refill
    /// the cache with the old value
    generation: Arc<AtomicU64>,
}

impl CachedStateReader {
    pub fn new(adapter: Arc<dyn StatePersistenceAdapter>, limit: usize) -> Self {
        Self {
            adapter,
            cache: Arc::new(LruCache::new(limit)),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn cache(&self) -> &LruCache<String, Value> {
        &self.cache
    }

    #[instrument(skip(self))]
    pub async fn get(&self, key: &str) -> Result<Option<Value>, PersistenceError> {
        let cache_key = key.to_string();
        if let Some(value) = self.cache.get(&cache_key) {
            debug!("Cache hit");
            return Ok(Some(value));
        }

        let generation = self.generation.load(Ordering::SeqCst);
        let value = self.adapter.get_item(key).await?;
        if let Some(value) = &value {
            if self.generation.load(Ordering::SeqCst) == generation {
                self.cache.set(cache_key, value.clone());
            }
        }
        Ok(value)
    }

    /// Spawns the task that drops cached entries on adapter updates
    pub fn start_invalidation(&self) -> JoinHandle<()> {
        let mut updates = self.adapter.subscribe();
        let cache = self.cache.clone();
        let generation = self.generation.clone();
        let store = self.adapter.name().to_string();

        info!(store = %store, limit = cache.limit(), "Starting cache invalidation");

        tokio::spawn(async move {
            loop {
                match updates.recv().await {
                    Ok(event) => {
                        generation.fetch_add(1, Ordering::SeqCst);
                        match &event {
                            UpdateEvent::SetItem { key, .. } | UpdateEvent::RemoveItem { key } => {
                                cache.remove(key);
                            }
                            UpdateEvent::Clear => cache.clear(),
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        // Events were missed, so anything may be stale
                        warn!(store = %store, skipped, "Invalidation lagged, clearing cache");
                        generation.fetch_add(1, Ordering::SeqCst);
                        cache.clear();
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!(store = %store, "Cache invalidation stopped");
        })
    }
}
