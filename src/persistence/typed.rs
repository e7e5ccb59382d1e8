use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use tracing::{debug, instrument};

use super::adapter::StatePersistenceAdapter;
use super::errors::PersistenceError;

/// A persisted field with a fixed key and value type
///
/// Implementors are usually zero-sized marker types, one per entry of the
/// application state, so the full schema is known at compile time.
pub trait StateField {
    const KEY: &'static str;
    type Value: Serialize + DeserializeOwned + Send + Sync;
}

/// Typed view over a JSON-valued persistence adapter
#[derive(Clone)]
pub struct TypedStore {
    adapter: Arc<dyn StatePersistenceAdapter>,
}

impl TypedStore {
    pub fn new(adapter: Arc<dyn StatePersistenceAdapter>) -> Self {
        Self { adapter }
    }

    pub fn adapter(&self) -> &Arc<dyn StatePersistenceAdapter> {
        &self.adapter
    }

    /// Reads and decodes a field, `None` if it was never written
    #[instrument(skip(self), fields(key = F::KEY))]
    pub async fn get<F: StateField>(&self) -> Result<Option<F::Value>, PersistenceError> {
        match self.adapter.get_item(F::KEY).await? {
            Some(raw) => {
                let value = serde_json::from_value(raw).map_err(|e| {
                    PersistenceError::Serialization(format!("field '{}': {}", F::KEY, e))
                })?;
                Ok(Some(value))
            }
            None => {
                debug!("Field not present");
                Ok(None)
            }
        }
    }

    /// Reads a field, falling back to the type's default when absent
    pub async fn get_or_default<F>(&self) -> Result<F::Value, PersistenceError>
    where
        F: StateField,
        F::Value: Default,
    {
        Ok(self.get::<F>().await?.unwrap_or_default())
    }

    #[instrument(skip(self, value), fields(key = F::KEY))]
    pub async fn set<F: StateField>(&self, value: &F::Value) -> Result<(), PersistenceError> {
        let raw = serde_json::to_value(value)?;
        self.adapter.set_item(F::KEY, raw).await
    }

    pub async fn remove<F: StateField>(&self) -> Result<(), PersistenceError> {
        self.adapter.remove_item(F::KEY).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::backend::InMemoryBackend;
    use crate::persistence::base::BaseStatePersistenceAdapter;
    use crate::persistence::schema::{AppSettings, Settings, TickerBuckets};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn store() -> TypedStore {
        TypedStore::new(Arc::new(BaseStatePersistenceAdapter::new(
            InMemoryBackend::new("typed"),
        )))
    }

    #[tokio::test]
    async fn test_typed_round_trip() {
        let store = store();
        let mut buckets = BTreeMap::new();
        buckets.insert(
            "tech".to_string(),
            vec!["AAPL".to_string(), "MSFT".to_string()],
        );

        store.set::<TickerBuckets>(&buckets).await.unwrap();

        assert_eq!(store.get::<TickerBuckets>().await.unwrap(), Some(buckets));
        assert_eq!(
            store.adapter().get_item(TickerBuckets::KEY).await.unwrap(),
            Some(json!({"tech": ["AAPL", "MSFT"]}))
        );
    }

    #[tokio::test]
    async fn test_missing_field_uses_default() {
        let store = store();
        let settings = store.get_or_default::<Settings>().await.unwrap();
        assert_eq!(settings, AppSettings::default());
    }

    #[tokio::test]
    async fn test_mistyped_value_is_serialization_error() {
        let store = store();
        store
            .adapter()
            .set_item(TickerBuckets::KEY, json!("not a map"))
            .await
            .unwrap();

        let result = store.get::<TickerBuckets>().await;
        assert!(matches!(result, Err(PersistenceError::Serialization(_))));
    }

    #[tokio::test]
    async fn test_remove_field() {
        let store = store();
        store
            .set::<Settings>(&AppSettings {
                sync_room: Some("desk-1".to_string()),
                ..AppSettings::default()
            })
            .await
            .unwrap();

        store.remove::<Settings>().await.unwrap();
        assert_eq!(store.get::<Settings>().await.unwrap(), None);
    }
}
