// Rooms: one pub/sub session per broker topic

// Public API - what other modules can use
pub use errors::{RoomError, RoomEventError};
pub use events::{RoomEvent, RoomFailure, RoomMessage};
pub use handler::RoomEventHandler;
pub use messages::{Envelope, PresenceStatus};
pub use models::{ConnectionState, RoomName, MAX_ROOM_NAME_LEN};
pub use room::{Room, SendOptions};
pub use subscription::RoomSubscription;

// Internal modules
mod errors;
mod events;
mod handler;
mod messages;
mod models;
mod presence;
#[allow(clippy::module_inception)]
mod room;
mod subscription;
