use async_trait::async_trait;
use std::sync::Arc;

use super::errors::RoomEventError;
use super::events::RoomEvent;
use super::room::Room;

/// Trait for components that react to one room's events
///
/// Handlers receive the room itself so they can read its state or reply on
/// its topic without holding their own reference.
#[async_trait]
pub trait RoomEventHandler: Send + Sync {
    /// Handle a room event
    ///
    /// Errors are logged by the subscription and do not stop delivery.
    async fn handle_room_event(
        &self,
        room: &Arc<Room>,
        event: RoomEvent,
    ) -> Result<(), RoomEventError>;

    /// Get a human-readable name for this handler (for logging/debugging)
    fn handler_name(&self) -> &'static str;
}
