// Library crate for the ticker-sync multi-device state layer
// This file exposes the public API for the binary and integration tests

pub mod broker;
pub mod cache;
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod persistence;
pub mod room;
pub mod shared;
pub mod sync;

// Re-export commonly used types for easier access in tests
pub use broker::{BrokerTransport, InMemoryBroker, MqttTransport};
pub use cache::{CachedStateReader, LruCache};
pub use cli::Cli;
pub use config::SyncConfig;
pub use coordinator::{CoordinatorStatus, RoomCoordinator};
pub use persistence::{
    BaseStatePersistenceAdapter, DurableKeyValueStore, PersistenceError, StatePersistenceAdapter,
    TypedStore, UpdateEvent,
};
pub use room::{ConnectionState, Room, RoomError, RoomEvent, SendOptions};
pub use shared::{AppError, SyncContext};
pub use sync::{StateSnapshot, StateSyncBridge};
