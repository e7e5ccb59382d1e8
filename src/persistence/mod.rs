// Durable local state
//
// A JSON key/value store with change notification. Backends only store;
// the base adapter adds lifecycle, write ordering and update events.

// Public API - what other modules can use
pub use adapter::{StatePersistenceAdapter, UpdateEvent};
pub use backend::{InMemoryBackend, KeyValueBackend};
pub use base::BaseStatePersistenceAdapter;
pub use errors::PersistenceError;
pub use sqlite::{DurableKeyValueStore, SqliteBackend};
pub use typed::{StateField, TypedStore};

// Internal modules
mod adapter;
mod backend;
mod base;
mod errors;
pub mod schema;
mod sqlite;
mod typed;
