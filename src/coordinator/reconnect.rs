use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument};

use crate::config::RoomConfig;
use crate::room::{Room, RoomEvent, RoomEventError, RoomEventHandler};

/// Exponential backoff between reconnect attempts
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectPolicy {
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl ReconnectPolicy {
    /// `None` when the config turns reconnecting off
    pub fn from_config(config: &RoomConfig) -> Option<Self> {
        config.auto_reconnect.then(|| Self {
            min_delay: Duration::from_millis(config.reconnect_min_ms),
            max_delay: Duration::from_millis(config.reconnect_max_ms.max(config.reconnect_min_ms)),
        })
    }

    /// Delay before attempt number `attempt`, counting from zero
    pub fn delay(&self, attempt: u32) -> Duration {
        self.min_delay
            .checked_mul(1u32 << attempt.min(16))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

/// Brings a room back after its session ends on its own
///
/// Broker drops and retryable failures leave the room `disconnected` or
/// `error`; this handler waits out the backoff and calls `connect` again.
/// Rooms disconnected on request, closed rooms and rooms that reconnected in
/// the meantime are left alone. The attempt counter resets once the room is
/// back in sync.
pub(super) struct ReconnectHandler {
    policy: ReconnectPolicy,
    attempts: AtomicU32,
}

impl ReconnectHandler {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            attempts: AtomicU32::new(0),
        }
    }

    fn wants_reconnect(room: &Room) -> bool {
        room.state().is_idle() && !room.disconnect_requested()
    }
}

#[async_trait]
impl RoomEventHandler for ReconnectHandler {
    #[instrument(skip(self, room, event), fields(room = %room.name()))]
    async fn handle_room_event(
        &self,
        room: &Arc<Room>,
        event: RoomEvent,
    ) -> Result<(), RoomEventError> {
        match event {
            RoomEvent::Sync => self.attempts.store(0, Ordering::SeqCst),
            RoomEvent::Disconnect if Self::wants_reconnect(room) => {
                let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
                let delay = self.policy.delay(attempt);
                debug!(attempt, delay_ms = delay.as_millis() as u64, "Scheduling reconnect");
                tokio::time::sleep(delay).await;

                if Self::wants_reconnect(room) {
                    info!(attempt, "Reconnecting room");
                    room.connect()
                        .map_err(|e| RoomEventError::HandlerError(e.to_string()))?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn handler_name(&self) -> &'static str {
        "RoomReconnect"
    }
}
