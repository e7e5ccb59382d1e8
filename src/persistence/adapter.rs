use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use super::errors::PersistenceError;

/// Notification emitted after a mutation of the store has committed
///
/// Serialized with a `type` tag (`setItem`, `removeItem`, `clear`) so the
/// event shape matches what other replicas of the store expect on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum UpdateEvent {
    SetItem { key: String, value: Value },
    RemoveItem { key: String },
    Clear,
}

impl UpdateEvent {
    /// The key touched by this event, `None` for a store-wide clear
    pub fn key(&self) -> Option<&str> {
        match self {
            UpdateEvent::SetItem { key, .. } | UpdateEvent::RemoveItem { key } => Some(key),
            UpdateEvent::Clear => None,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            UpdateEvent::SetItem { .. } => "setItem",
            UpdateEvent::RemoveItem { .. } => "removeItem",
            UpdateEvent::Clear => "clear",
        }
    }
}

/// Asynchronous key/value persistence with change notification
///
/// Every other operation waits for [`ready`](Self::ready) internally, so the
/// store is opened exactly once no matter which call comes first. Each
/// successful mutation emits exactly one [`UpdateEvent`] after the write has
/// committed, including writes issued from this process. Failed writes emit
/// nothing.
#[async_trait]
pub trait StatePersistenceAdapter: Send + Sync {
    /// Name of the backing store
    fn name(&self) -> &str;

    /// Opens the backing store. Concurrent callers share one initialization.
    async fn ready(&self) -> Result<(), PersistenceError>;

    async fn get_all_keys(&self) -> Result<Vec<String>, PersistenceError>;

    async fn get_all_values(&self) -> Result<Vec<Value>, PersistenceError>;

    /// Returns `None` for absent keys
    async fn get_item(&self, key: &str) -> Result<Option<Value>, PersistenceError>;

    async fn set_item(&self, key: &str, value: Value) -> Result<(), PersistenceError>;

    /// Removing an absent key still succeeds and still emits `removeItem`
    async fn remove_item(&self, key: &str) -> Result<(), PersistenceError>;

    async fn clear(&self) -> Result<(), PersistenceError>;

    /// Subscribe to update events. Dropping the receiver unsubscribes.
    fn subscribe(&self) -> broadcast::Receiver<UpdateEvent>;
}
