use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::room::{ConnectionState, Room};

/// Rooms known to a coordinator, keyed by name
#[derive(Default)]
pub(super) struct CoordinatorState {
    /// Every requested room, including ones still connecting
    pub rooms: BTreeMap<String, Arc<Room>>,
    /// Rooms in `connected` or `inSync`; always a subset of `rooms`
    pub connected_rooms: BTreeMap<String, Arc<Room>>,
}

impl CoordinatorState {
    /// True only if there is at least one room and every room is in sync
    pub fn all_rooms_in_sync(&self) -> bool {
        !self.rooms.is_empty()
            && self
                .rooms
                .values()
                .all(|room| room.state() == ConnectionState::InSync)
    }

    pub fn total_participants(&self) -> usize {
        self.connected_rooms
            .values()
            .map(|room| room.participant_count())
            .sum()
    }

    /// Whether `rooms` holds this exact room instance
    pub fn holds(&self, room: &Arc<Room>) -> bool {
        self.rooms
            .get(room.name())
            .map(|held| Arc::ptr_eq(held, room))
            .unwrap_or(false)
    }

    pub fn snapshot(&self) -> CoordinatorStatus {
        CoordinatorStatus {
            rooms: self.rooms.keys().cloned().collect(),
            connected_rooms: self.connected_rooms.keys().cloned().collect(),
            all_rooms_in_sync: self.all_rooms_in_sync(),
            total_participants: self.total_participants(),
        }
    }
}

/// Point-in-time view of a coordinator, published on every change
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CoordinatorStatus {
    pub rooms: Vec<String>,
    pub connected_rooms: Vec<String>,
    pub all_rooms_in_sync: bool,
    pub total_participants: usize,
}
