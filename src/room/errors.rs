use thiserror::Error;

use crate::broker::TransportError;

/// Errors returned by room operations
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RoomError {
    #[error("Invalid room name {name:?}: {reason}")]
    InvalidName { name: String, reason: String },

    #[error("Room is not connected")]
    NotConnected,

    #[error("Room is closed")]
    Closed,

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Failed to encode payload: {0}")]
    Encoding(String),
}

impl RoomError {
    /// Whether the room must be closed rather than left reconnectable
    pub fn is_fatal(&self) -> bool {
        match self {
            RoomError::Transport(error) => error.is_fatal(),
            _ => false,
        }
    }
}

/// Errors that can occur when handling room events
#[derive(Debug, Error)]
pub enum RoomEventError {
    #[error("Room not found: {0}")]
    RoomNotFound(String),

    #[error("Handler error: {0}")]
    HandlerError(String),
}
