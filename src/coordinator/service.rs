use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, instrument, warn};

use super::lifecycle::{CoordinatorShared, RoomLifecycleSubscriber};
use super::reconnect::{ReconnectHandler, ReconnectPolicy};
use super::status::CoordinatorStatus;
use crate::broker::BrokerTransport;
use crate::config::RoomConfig;
use crate::room::{Room, RoomName, RoomSubscription};

/// Owns every room of a process and folds their states into one status
///
/// Rooms are keyed by name. A lifecycle handler subscribed to each room keeps
/// `connected_rooms` current and republishes [`CoordinatorStatus`] under the
/// same write guard as each map change. Unless the room config turns it off,
/// a second handler reconnects rooms whose session ended on its own.
pub struct RoomCoordinator {
    transport: Arc<dyn BrokerTransport>,
    config: RoomConfig,
    reconnect: Option<ReconnectPolicy>,
    shared: Arc<CoordinatorShared>,
}

impl RoomCoordinator {
    pub fn new(transport: Arc<dyn BrokerTransport>, config: RoomConfig) -> Self {
        Self {
            transport,
            reconnect: ReconnectPolicy::from_config(&config),
            config,
            shared: Arc::new(CoordinatorShared::new()),
        }
    }

    /// Creates, registers and connects a room
    ///
    /// Returns `None` with a warning when the name is invalid or a room with
    /// that name already exists.
    #[instrument(skip(self))]
    pub async fn connect_to_room(&self, name: &str) -> Option<Arc<Room>> {
        self.connect_to_room_with(name, |_| {}).await
    }

    /// Like [`connect_to_room`](Self::connect_to_room), running `before_connect`
    /// on the new room before it starts connecting, so subscribers attached
    /// there see every event
    #[instrument(skip(self, before_connect))]
    pub async fn connect_to_room_with<F>(&self, name: &str, before_connect: F) -> Option<Arc<Room>>
    where
        F: FnOnce(&Arc<Room>),
    {
        if let Err(e) = RoomName::parse(name) {
            warn!(error = %e, "Refusing to connect to room");
            return None;
        }

        let mut state = self.shared.state.write().await;
        if state.rooms.contains_key(name) {
            warn!("Room already exists, ignoring connect");
            return None;
        }

        let room = Arc::new(Room::new(name, self.transport.clone(), &self.config));
        let handler = Arc::new(RoomLifecycleSubscriber::new(self.shared.clone()));
        RoomSubscription::new(room.clone(), handler).start();
        if let Some(policy) = self.reconnect {
            RoomSubscription::new(room.clone(), Arc::new(ReconnectHandler::new(policy))).start();
        }

        state.rooms.insert(name.to_string(), room.clone());
        before_connect(&room);

        if let Err(e) = room.connect() {
            warn!(error = %e, "Room failed to connect");
            state.rooms.remove(name);
            self.shared.publish(&state);
            return None;
        }

        self.shared.publish(&state);
        info!(topic = %room.topic(), "Room registered");
        Some(room)
    }

    /// Closes a room and forgets it
    #[instrument(skip(self, room), fields(room = %room.name()))]
    pub async fn disconnect_from_room(&self, room: &Arc<Room>) {
        room.close().await;

        let mut state = self.shared.state.write().await;
        if state.holds(room) {
            state.rooms.remove(room.name());
            state.connected_rooms.remove(room.name());
            self.shared.publish(&state);
        }
    }

    /// Closes every room concurrently
    #[instrument(skip(self))]
    pub async fn disconnect_all(&self) {
        let rooms = self.rooms().await;
        info!(count = rooms.len(), "Closing all rooms");
        join_all(rooms.iter().map(|room| self.disconnect_from_room(room))).await;
    }

    /// All registered rooms, including those still connecting
    pub async fn rooms(&self) -> Vec<Arc<Room>> {
        self.shared.state.read().await.rooms.values().cloned().collect()
    }

    /// Rooms currently `connected` or `inSync`
    pub async fn connected_rooms(&self) -> Vec<Arc<Room>> {
        self.shared
            .state
            .read()
            .await
            .connected_rooms
            .values()
            .cloned()
            .collect()
    }

    pub async fn room(&self, name: &str) -> Option<Arc<Room>> {
        self.shared.state.read().await.rooms.get(name).cloned()
    }

    /// False when there are no rooms
    pub async fn all_rooms_in_sync(&self) -> bool {
        self.shared.state.read().await.all_rooms_in_sync()
    }

    /// Sum of participant counts over connected rooms
    pub async fn total_participants_for_all_rooms(&self) -> usize {
        self.shared.state.read().await.total_participants()
    }

    /// Latest published status
    pub fn status(&self) -> CoordinatorStatus {
        self.shared.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<CoordinatorStatus> {
        self.shared.status.subscribe()
    }
}
