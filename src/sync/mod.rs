// Replication of persisted state over rooms

// Public API - what other modules can use
pub use bridge::{merge_snapshots, StateSnapshot, StateSyncBridge};

// Internal modules
mod bridge;
