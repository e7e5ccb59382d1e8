use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::errors::RoomError;

/// Tag that marks a payload as part of the sync protocol
pub const ENVELOPE_TAG: &str = "$type";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    /// Joined; peers answer with `Here`
    Hello,
    Here,
    Leave,
}

/// Everything the rooms of this crate publish on a room topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "$type", rename_all = "lowercase")]
pub enum Envelope {
    Data { session: String, payload: Value },
    Presence { session: String, status: PresenceStatus },
    Probe { session: String, nonce: String },
}

/// A decoded room payload
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Envelope(Envelope),
    /// Valid JSON from a publisher that does not speak the envelope protocol
    Foreign(Value),
}

impl Envelope {
    pub fn encode(&self) -> Result<Vec<u8>, RoomError> {
        serde_json::to_vec(self).map_err(|e| RoomError::Encoding(e.to_string()))
    }
}

/// Decodes a raw payload. Returns `Ok(None)` for an empty payload, which is
/// how a retained message gets cleared.
pub fn decode(bytes: &[u8]) -> Result<Option<Incoming>, RoomError> {
    if bytes.is_empty() {
        return Ok(None);
    }

    let value: Value =
        serde_json::from_slice(bytes).map_err(|e| RoomError::MalformedPayload(e.to_string()))?;

    let tagged = value
        .as_object()
        .map(|object| object.contains_key(ENVELOPE_TAG))
        .unwrap_or(false);
    if !tagged {
        return Ok(Some(Incoming::Foreign(value)));
    }

    serde_json::from_value(value)
        .map(|envelope| Some(Incoming::Envelope(envelope)))
        .map_err(|e| RoomError::MalformedPayload(e.to_string()))
}
