use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, instrument, warn};

use super::status::{CoordinatorState, CoordinatorStatus};
use crate::room::{Room, RoomEvent, RoomEventError, RoomEventHandler};

/// State shared by a coordinator and the lifecycle handlers of its rooms
pub(super) struct CoordinatorShared {
    pub state: RwLock<CoordinatorState>,
    pub status: watch::Sender<CoordinatorStatus>,
}

impl CoordinatorShared {
    pub fn new() -> Self {
        let (status, _) = watch::channel(CoordinatorStatus::default());
        Self {
            state: RwLock::new(CoordinatorState::default()),
            status,
        }
    }

    /// Republishes the status; call with the state guard held
    pub fn publish(&self, state: &CoordinatorState) {
        self.status.send_replace(state.snapshot());
    }
}

/// Keeps the coordinator's maps in step with one room's lifecycle events
pub(super) struct RoomLifecycleSubscriber {
    shared: Arc<CoordinatorShared>,
}

impl RoomLifecycleSubscriber {
    pub fn new(shared: Arc<CoordinatorShared>) -> Self {
        Self { shared }
    }
}

#[async_trait]
impl RoomEventHandler for RoomLifecycleSubscriber {
    #[instrument(skip(self, room, event), fields(room = %room.name(), event = event.event_name()))]
    async fn handle_room_event(
        &self,
        room: &Arc<Room>,
        event: RoomEvent,
    ) -> Result<(), RoomEventError> {
        if matches!(event, RoomEvent::Message(_)) {
            return Ok(());
        }

        let mut state = self.shared.state.write().await;
        match event {
            RoomEvent::Connect | RoomEvent::Sync => {
                if !state.holds(room) {
                    return Err(RoomEventError::RoomNotFound(room.name().to_string()));
                }
                // The event may be stale by the time it is handled
                if room.state().is_connected()
                    && !state.connected_rooms.contains_key(room.name())
                {
                    state
                        .connected_rooms
                        .insert(room.name().to_string(), room.clone());
                    debug!("Room marked connected");
                }
            }
            RoomEvent::Disconnect => {
                if state.holds(room) {
                    state.connected_rooms.remove(room.name());
                    debug!("Room marked disconnected");
                }
            }
            RoomEvent::Close => {
                if state.holds(room) {
                    state.rooms.remove(room.name());
                    state.connected_rooms.remove(room.name());
                    info!("Closed room removed from coordinator");
                }
            }
            RoomEvent::Error(failure) => {
                warn!(detail = %failure.detail, fatal = failure.fatal, "Room reported an error");
            }
            RoomEvent::Presence { .. } | RoomEvent::Message(_) => {}
        }

        self.shared.publish(&state);
        Ok(())
    }

    fn handler_name(&self) -> &'static str {
        "RoomLifecycleSubscriber"
    }
}
