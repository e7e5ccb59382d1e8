use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::handler::RoomEventHandler;
use super::room::Room;

/// Routes one room's events to a handler on a background task
pub struct RoomSubscription {
    room: Arc<Room>,
    handler: Arc<dyn RoomEventHandler>,
}

impl RoomSubscription {
    pub fn new(room: Arc<Room>, handler: Arc<dyn RoomEventHandler>) -> Self {
        Self { room, handler }
    }

    /// Start the subscription
    ///
    /// The receiver is created before this returns, so every event the room
    /// emits afterwards reaches the handler. The task ends after the room
    /// closes.
    pub fn start(self) -> JoinHandle<()> {
        let room_name = self.room.name().to_string();
        let handler_name = self.handler.handler_name();

        info!(
            room = %room_name,
            handler = handler_name,
            "Starting room subscription"
        );

        let mut receiver = self.room.subscribe();

        tokio::spawn(async move {
            loop {
                let event = match receiver.recv().await {
                    Ok(event) => event,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(
                            room = %room_name,
                            handler = handler_name,
                            skipped,
                            "Room subscription lagged, events dropped"
                        );
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };

                debug!(
                    room = %room_name,
                    handler = handler_name,
                    event = event.event_name(),
                    "Received room event"
                );

                if let Err(e) = self.handler.handle_room_event(&self.room, event).await {
                    warn!(
                        room = %room_name,
                        handler = handler_name,
                        error = %e,
                        "Room event handler failed"
                    );
                }
            }

            info!(
                room = %room_name,
                handler = handler_name,
                "Room subscription ended - no more events"
            );
        })
    }
}
