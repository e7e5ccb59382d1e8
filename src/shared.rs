use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{info, instrument};

use crate::broker::{BrokerTransport, MqttTransport, TransportError};
use crate::cache::CachedStateReader;
use crate::config::{ConfigError, SyncConfig};
use crate::coordinator::RoomCoordinator;
use crate::persistence::{DurableKeyValueStore, PersistenceError, StatePersistenceAdapter};
use crate::room::{Room, RoomError};
use crate::sync::StateSyncBridge;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Room error: {0}")]
    Room(#[from] RoomError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Room {0} could not be joined")]
    JoinRefused(String),
}

/// Shared application state containing all dependencies
///
/// Built once at startup and handed to whatever needs the sync layer.
#[derive(Clone)]
pub struct SyncContext {
    pub coordinator: Arc<RoomCoordinator>,
    pub persistence: Arc<dyn StatePersistenceAdapter>,
    pub reader: Arc<CachedStateReader>,
}

impl SyncContext {
    pub fn new(
        transport: Arc<dyn BrokerTransport>,
        persistence: Arc<dyn StatePersistenceAdapter>,
        config: &SyncConfig,
    ) -> Self {
        let reader = Arc::new(CachedStateReader::new(
            persistence.clone(),
            config.cache.limit,
        ));
        reader.start_invalidation();

        Self {
            coordinator: Arc::new(RoomCoordinator::new(transport, config.room.clone())),
            persistence,
            reader,
        }
    }

    /// Production wiring: MQTT broker and SQLite store
    pub fn from_config(config: &SyncConfig) -> Result<Self, AppError> {
        let transport = Arc::new(MqttTransport::new(config.broker.clone()));
        let persistence = Arc::new(DurableKeyValueStore::from_config(&config.storage)?);
        Ok(Self::new(transport, persistence, config))
    }

    /// Connects to a room and replicates the store through it
    #[instrument(skip(self))]
    pub async fn join_room(&self, name: &str) -> Result<(Arc<Room>, JoinHandle<()>), AppError> {
        let mut bridge = None;
        let room = self
            .coordinator
            .connect_to_room_with(name, |room| {
                bridge = Some(StateSyncBridge::new(room.clone(), self.persistence.clone()).start());
            })
            .await
            .ok_or_else(|| AppError::JoinRefused(name.to_string()))?;
        let bridge = bridge.ok_or_else(|| AppError::JoinRefused(name.to_string()))?;
        info!(topic = %room.topic(), "Joined room with state sync");
        Ok((room, bridge))
    }
}
