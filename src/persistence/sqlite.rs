use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::str::FromStr;
use tracing::{debug, instrument, warn};

use super::backend::KeyValueBackend;
use super::base::BaseStatePersistenceAdapter;
use super::errors::PersistenceError;
use crate::config::StorageConfig;

/// Maximum length of a store name
pub const MAX_STORE_NAME_LEN: usize = 128;

/// Durable, SQLite-backed persistence adapter
pub type DurableKeyValueStore = BaseStatePersistenceAdapter<SqliteBackend>;

/// SQLite implementation of the key/value backend
///
/// All named stores share one `kv_entries` table keyed by `(store, key)`.
/// Values are stored as JSON text. The pool is created lazily and the first
/// connection is made when the adapter calls [`KeyValueBackend::open`].
pub struct SqliteBackend {
    pool: SqlitePool,
    store_name: String,
}

impl SqliteBackend {
    pub fn new(pool: SqlitePool, store_name: &str) -> Result<Self, PersistenceError> {
        validate_store_name(store_name)?;
        Ok(Self {
            pool,
            store_name: store_name.to_string(),
        })
    }

    /// Creates a backend for a database URL such as `sqlite://state.db`
    pub fn connect_lazy(
        database_url: &str,
        store_name: &str,
        max_connections: u32,
    ) -> Result<Self, PersistenceError> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_lazy_with(options);
        Self::new(pool, store_name)
    }

    /// Private in-memory database, useful for tests
    ///
    /// A single connection that is never recycled keeps the database alive for
    /// the lifetime of the pool.
    pub fn in_memory(store_name: &str) -> Result<Self, PersistenceError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_lazy_with(options);
        Self::new(pool, store_name)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

impl DurableKeyValueStore {
    /// Builds the durable store described by the storage configuration
    pub fn from_config(config: &StorageConfig) -> Result<Self, PersistenceError> {
        let backend = SqliteBackend::connect_lazy(
            &config.database_url,
            &config.store_name,
            config.max_connections,
        )?;
        Ok(Self::with_event_capacity(backend, config.event_capacity))
    }
}

fn validate_store_name(store_name: &str) -> Result<(), PersistenceError> {
    if store_name.is_empty() || store_name.len() > MAX_STORE_NAME_LEN {
        return Err(PersistenceError::InvalidStoreName(format!(
            "store name must be 1-{} bytes, got {}",
            MAX_STORE_NAME_LEN,
            store_name.len()
        )));
    }
    if store_name.chars().any(char::is_control) {
        return Err(PersistenceError::InvalidStoreName(
            "store name must not contain control characters".to_string(),
        ));
    }
    Ok(())
}

fn decode_value(key: &str, raw: &str) -> Result<Value, PersistenceError> {
    serde_json::from_str(raw).map_err(|e| {
        warn!(key = %key, error = %e, "Stored value is not valid JSON");
        PersistenceError::Corrupted(format!("value for '{}' is not valid JSON: {}", key, e))
    })
}

#[async_trait]
impl KeyValueBackend for SqliteBackend {
    fn store_name(&self) -> &str {
        &self.store_name
    }

    #[instrument(skip(self), fields(store = %self.store_name))]
    async fn open(&self) -> Result<(), PersistenceError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS kv_entries (
                store TEXT NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                PRIMARY KEY (store, key)
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| {
            warn!(error = %e, "Failed to open SQLite store");
            PersistenceError::from(e)
        })?;

        debug!("SQLite store ready");
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>, PersistenceError> {
        let rows = sqlx::query("SELECT key FROM kv_entries WHERE store = ?1 ORDER BY key")
            .bind(&self.store_name)
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| row.try_get::<String, _>("key").map_err(PersistenceError::from))
            .collect()
    }

    async fn values(&self) -> Result<Vec<Value>, PersistenceError> {
        let rows = sqlx::query("SELECT key, value FROM kv_entries WHERE store = ?1 ORDER BY key")
            .bind(&self.store_name)
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| {
                let key: String = row.try_get("key")?;
                let raw: String = row.try_get("value")?;
                decode_value(&key, &raw)
            })
            .collect()
    }

    async fn get(&self, key: &str) -> Result<Option<Value>, PersistenceError> {
        let row = sqlx::query("SELECT value FROM kv_entries WHERE store = ?1 AND key = ?2")
            .bind(&self.store_name)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let raw: String = row.try_get("value")?;
                decode_value(key, &raw).map(Some)
            }
            None => Ok(None),
        }
    }

    #[instrument(skip(self, value), fields(store = %self.store_name))]
    async fn put(&self, key: &str, value: &Value) -> Result<(), PersistenceError> {
        let raw = serde_json::to_string(value)?;

        sqlx::query(
            "INSERT INTO kv_entries (store, key, value) VALUES (?1, ?2, ?3)
             ON CONFLICT (store, key) DO UPDATE SET value = excluded.value",
        )
        .bind(&self.store_name)
        .bind(key)
        .bind(raw)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            warn!(key = %key, error = %e, "Failed to write entry");
            PersistenceError::from(e)
        })?;

        Ok(())
    }

    #[instrument(skip(self), fields(store = %self.store_name))]
    async fn delete(&self, key: &str) -> Result<(), PersistenceError> {
        let result = sqlx::query("DELETE FROM kv_entries WHERE store = ?1 AND key = ?2")
            .bind(&self.store_name)
            .bind(key)
            .execute(&self.pool)
            .await?;

        debug!(key = %key, rows = result.rows_affected(), "Entry removed");
        Ok(())
    }

    #[instrument(skip(self), fields(store = %self.store_name))]
    async fn clear(&self) -> Result<(), PersistenceError> {
        let result = sqlx::query("DELETE FROM kv_entries WHERE store = ?1")
            .bind(&self.store_name)
            .execute(&self.pool)
            .await?;

        debug!(rows = result.rows_affected(), "Store wiped");
        Ok(())
    }
}
