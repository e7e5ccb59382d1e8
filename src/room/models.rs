use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::errors::RoomError;

/// Longest accepted room name in bytes
pub const MAX_ROOM_NAME_LEN: usize = 64;

/// Lifecycle of a room's broker session
///
/// `Error` is a disconnected state: the last session failed but can be
/// reconnected. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    InSync,
    Error,
    Closed,
}

impl ConnectionState {
    /// Connected to the broker and subscribed to the room topic
    pub fn is_connected(self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::InSync)
    }

    /// No session is running and none is being negotiated
    pub fn is_idle(self) -> bool {
        matches!(
            self,
            ConnectionState::Disconnected | ConnectionState::Error
        )
    }

    pub fn is_terminal(self) -> bool {
        self == ConnectionState::Closed
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::InSync => "inSync",
            ConnectionState::Error => "error",
            ConnectionState::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated room name, safe to embed as one MQTT topic level
///
/// Accepts ASCII letters, digits, `-`, `_` and `.`, up to
/// [`MAX_ROOM_NAME_LEN`] bytes. Everything else (wildcards, separators,
/// `$`-prefixed system topics, whitespace) is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoomName(String);

impl RoomName {
    pub fn parse(name: &str) -> Result<Self, RoomError> {
        let invalid = |reason: &str| RoomError::InvalidName {
            name: name.to_string(),
            reason: reason.to_string(),
        };

        if name.is_empty() {
            return Err(invalid("name is empty"));
        }
        if name.len() > MAX_ROOM_NAME_LEN {
            return Err(invalid("name is too long"));
        }
        if let Some(c) = name
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
        {
            return Err(invalid(&format!("character {:?} is not allowed", c)));
        }

        Ok(Self(name.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Topic for this room under `prefix`
    pub fn topic(&self, prefix: &str) -> String {
        topic_for(prefix, &self.0)
    }
}

/// Joins `prefix` and `name` into one topic. `name` is not validated here.
pub(crate) fn topic_for(prefix: &str, name: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", prefix, name)
    }
}

impl FromStr for RoomName {
    type Err = RoomError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for RoomName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for RoomName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
