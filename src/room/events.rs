use chrono::{DateTime, Utc};
use serde_json::Value;

/// A payload received on the room topic
#[derive(Debug, Clone, PartialEq)]
pub struct RoomMessage {
    pub payload: Value,
    /// Replayed by the broker from its retained store
    pub retained: bool,
    /// Publishing session, `None` for publishers outside the sync protocol
    pub sender: Option<String>,
    pub received_at: DateTime<Utc>,
}

/// Why a room session failed
#[derive(Debug, Clone, PartialEq)]
pub struct RoomFailure {
    pub detail: String,
    /// The room closes instead of staying reconnectable
    pub fatal: bool,
}

/// Events that happen within a room
#[derive(Debug, Clone, PartialEq)]
pub enum RoomEvent {
    /// Subscribed to the room topic
    Connect,
    Disconnect,
    /// Terminal; nothing follows
    Close,
    Error(RoomFailure),
    Message(RoomMessage),
    /// The retained backlog has been delivered
    Sync,
    Presence { participants: usize },
}

impl RoomEvent {
    /// Stable event name for consumers
    pub fn event_name(&self) -> &'static str {
        match self {
            RoomEvent::Connect => "connect",
            RoomEvent::Disconnect => "disconnect",
            RoomEvent::Close => "close",
            RoomEvent::Error(_) => "error",
            RoomEvent::Message(_) => "message",
            RoomEvent::Sync => "sync",
            RoomEvent::Presence { .. } => "presence",
        }
    }
}
