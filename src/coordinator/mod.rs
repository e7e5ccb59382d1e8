// Room coordination: one registry of rooms per process

// Public API - what other modules can use
pub use reconnect::ReconnectPolicy;
pub use service::RoomCoordinator;
pub use status::CoordinatorStatus;

// Internal modules
mod lifecycle;
mod reconnect;
mod service;
mod status;
