use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, instrument, warn};

use super::errors::PersistenceError;

/// Storage engine underneath a persistence adapter
///
/// Backends only store; lifecycle and change notification live in
/// [`BaseStatePersistenceAdapter`](super::base::BaseStatePersistenceAdapter).
#[async_trait]
pub trait KeyValueBackend: Send + Sync {
    fn store_name(&self) -> &str;

    /// Opens the engine and creates whatever schema it needs
    async fn open(&self) -> Result<(), PersistenceError>;

    /// All keys in the store, ordered by key
    async fn keys(&self) -> Result<Vec<String>, PersistenceError>;

    /// All values in the store, ordered by key
    async fn values(&self) -> Result<Vec<Value>, PersistenceError>;

    async fn get(&self, key: &str) -> Result<Option<Value>, PersistenceError>;

    async fn put(&self, key: &str, value: &Value) -> Result<(), PersistenceError>;

    async fn delete(&self, key: &str) -> Result<(), PersistenceError>;

    async fn clear(&self) -> Result<(), PersistenceError>;
}

/// In-memory backend for development and testing
///
/// Data lives as long as the backend does. The engine can be switched into an
/// "unavailable" state to exercise storage failure paths.
pub struct InMemoryBackend {
    store_name: String,
    entries: Mutex<BTreeMap<String, Value>>,
    unavailable: AtomicBool,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new("memory")
    }
}

impl InMemoryBackend {
    pub fn new(store_name: impl Into<String>) -> Self {
        Self {
            store_name: store_name.into(),
            entries: Mutex::new(BTreeMap::new()),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Makes every subsequent operation fail as if the engine went away
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn entry_count(&self) -> usize {
        self.entries().len()
    }

    fn entries(&self) -> MutexGuard<'_, BTreeMap<String, Value>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_available(&self) -> Result<(), PersistenceError> {
        if self.unavailable.load(Ordering::SeqCst) {
            warn!(store = %self.store_name, "In-memory store marked unavailable");
            return Err(PersistenceError::Unavailable(format!(
                "store '{}' is not available",
                self.store_name
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl KeyValueBackend for InMemoryBackend {
    fn store_name(&self) -> &str {
        &self.store_name
    }

    async fn open(&self) -> Result<(), PersistenceError> {
        self.check_available()?;
        debug!(store = %self.store_name, "In-memory store opened");
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>, PersistenceError> {
        self.check_available()?;
        Ok(self.entries().keys().cloned().collect())
    }

    async fn values(&self) -> Result<Vec<Value>, PersistenceError> {
        self.check_available()?;
        Ok(self.entries().values().cloned().collect())
    }

    async fn get(&self, key: &str) -> Result<Option<Value>, PersistenceError> {
        self.check_available()?;
        Ok(self.entries().get(key).cloned())
    }

    #[instrument(skip(self, value))]
    async fn put(&self, key: &str, value: &Value) -> Result<(), PersistenceError> {
        self.check_available()?;
        self.entries().insert(key.to_string(), value.clone());
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete(&self, key: &str) -> Result<(), PersistenceError> {
        self.check_available()?;
        self.entries().remove(key);
        Ok(())
    }

    async fn clear(&self) -> Result<(), PersistenceError> {
        self.check_available()?;
        self.entries().clear();
        Ok(())
    }
}
