use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{broadcast, Mutex, OnceCell};
use tracing::{debug, info, instrument, warn};

use super::adapter::{StatePersistenceAdapter, UpdateEvent};
use super::backend::KeyValueBackend;
use super::errors::PersistenceError;

/// Default number of update events buffered per subscriber
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Lifecycle and change-notification wrapper shared by every adapter
///
/// Owns one storage backend and gives it the adapter contract:
/// - the backend is opened once, lazily, by whichever call arrives first
/// - writes are serialized, and each emits its [`UpdateEvent`] while the write
///   lock is still held, so events go out in commit order
/// - nothing is emitted when the backend reports an error
pub struct BaseStatePersistenceAdapter<B: KeyValueBackend> {
    backend: B,
    opened: OnceCell<()>,
    write_lock: Mutex<()>,
    updates: broadcast::Sender<UpdateEvent>,
}

impl<B: KeyValueBackend> BaseStatePersistenceAdapter<B> {
    pub fn new(backend: B) -> Self {
        Self::with_event_capacity(backend, DEFAULT_EVENT_CAPACITY)
    }

    pub fn with_event_capacity(backend: B, event_capacity: usize) -> Self {
        let (updates, _) = broadcast::channel(event_capacity.max(1));
        Self {
            backend,
            opened: OnceCell::new(),
            write_lock: Mutex::new(()),
            updates,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn is_ready(&self) -> bool {
        self.opened.initialized()
    }

    fn emit(&self, event: UpdateEvent) {
        let event_type = event.event_type();
        match self.updates.send(event) {
            Ok(receivers) => debug!(
                store = %self.backend.store_name(),
                event_type,
                receivers,
                "Update event emitted"
            ),
            Err(_) => debug!(
                store = %self.backend.store_name(),
                event_type,
                "Update event emitted with no subscribers"
            ),
        }
    }
}

#[async_trait]
impl<B: KeyValueBackend> StatePersistenceAdapter for BaseStatePersistenceAdapter<B> {
    fn name(&self) -> &str {
        self.backend.store_name()
    }

    async fn ready(&self) -> Result<(), PersistenceError> {
        self.opened
            .get_or_try_init(|| async {
                info!(store = %self.backend.store_name(), "Opening persistence store");
                self.backend.open().await.map_err(|e| {
                    warn!(store = %self.backend.store_name(), error = %e, "Failed to open store");
                    e
                })
            })
            .await?;
        Ok(())
    }

    async fn get_all_keys(&self) -> Result<Vec<String>, PersistenceError> {
        self.ready().await?;
        self.backend.keys().await
    }

    async fn get_all_values(&self) -> Result<Vec<Value>, PersistenceError> {
        self.ready().await?;
        self.backend.values().await
    }

    async fn get_item(&self, key: &str) -> Result<Option<Value>, PersistenceError> {
        self.ready().await?;
        self.backend.get(key).await
    }

    #[instrument(skip(self, value), fields(store = %self.backend.store_name()))]
    async fn set_item(&self, key: &str, value: Value) -> Result<(), PersistenceError> {
        self.ready().await?;
        let _guard = self.write_lock.lock().await;

        self.backend.put(key, &value).await?;
        self.emit(UpdateEvent::SetItem {
            key: key.to_string(),
            value,
        });
        Ok(())
    }

    #[instrument(skip(self), fields(store = %self.backend.store_name()))]
    async fn remove_item(&self, key: &str) -> Result<(), PersistenceError> {
        self.ready().await?;
        let _guard = self.write_lock.lock().await;

        self.backend.delete(key).await?;
        self.emit(UpdateEvent::RemoveItem {
            key: key.to_string(),
        });
        Ok(())
    }

    #[instrument(skip(self), fields(store = %self.backend.store_name()))]
    async fn clear(&self) -> Result<(), PersistenceError> {
        self.ready().await?;
        let _guard = self.write_lock.lock().await;

        self.backend.clear().await?;
        info!(store = %self.backend.store_name(), "Store cleared");
        self.emit(UpdateEvent::Clear);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<UpdateEvent> {
        self.updates.subscribe()
    }
}
