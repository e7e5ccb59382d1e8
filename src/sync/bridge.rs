use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::broadcast::{
    self,
    error::{RecvError, TryRecvError},
};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::persistence::{PersistenceError, StatePersistenceAdapter, UpdateEvent};
use crate::room::{ConnectionState, Room, RoomEvent, RoomMessage, SendOptions};

/// Replicated view of a store, published retained on the room topic
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StateSnapshot {
    pub entries: BTreeMap<String, Value>,
}

impl StateSnapshot {
    /// Reads a snapshot out of a room payload, `None` if it is something else
    pub fn from_payload(payload: &Value) -> Option<Self> {
        serde_json::from_value(payload.clone()).ok()
    }

    pub fn to_payload(&self) -> Value {
        let entries = self
            .entries
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect::<serde_json::Map<_, _>>();
        serde_json::json!({ "entries": entries })
    }

    fn retain_prefix(mut self, prefix: Option<&str>) -> Self {
        if let Some(prefix) = prefix {
            self.entries.retain(|key, _| key.starts_with(prefix));
        }
        self
    }
}

/// Keeps a persistence adapter and a room in agreement
///
/// Local changes are published as a retained snapshot so late joiners start
/// from the latest state. Remote snapshots are merged against the last
/// snapshot both sides agreed on: keys this device changed since then keep
/// the local value, every other key takes the remote one. While the room is
/// still replaying its retained backlog the remote snapshot is held back and
/// merged once the room reaches `sync`, so edits made offline survive a
/// reconnect. Runs as one task, so merges and local publishes never
/// interleave.
pub struct StateSyncBridge {
    room: Arc<Room>,
    adapter: Arc<dyn StatePersistenceAdapter>,
    key_prefix: Option<String>,
}

struct BridgeState {
    /// Last snapshot both sides agreed on
    last_synced: StateSnapshot,
    /// Newest remote snapshot from the retained backlog, merged at `sync`
    held_remote: Option<StateSnapshot>,
}

/// Three-way merge of `remote` into `local`
///
/// A key whose local value differs from `base` (added, changed or removed
/// on this device) keeps the local value. All other keys follow `remote`.
pub fn merge_snapshots(
    base: &StateSnapshot,
    local: &StateSnapshot,
    remote: &StateSnapshot,
) -> StateSnapshot {
    let mut merged = remote.clone();
    let touched = local.entries.keys().chain(base.entries.keys());
    for key in touched {
        let local_value = local.entries.get(key);
        if local_value == base.entries.get(key) {
            continue;
        }
        match local_value {
            Some(value) => merged.entries.insert(key.clone(), value.clone()),
            None => merged.entries.remove(key),
        };
    }
    merged
}

impl StateSyncBridge {
    pub fn new(room: Arc<Room>, adapter: Arc<dyn StatePersistenceAdapter>) -> Self {
        Self {
            room,
            adapter,
            key_prefix: None,
        }
    }

    /// Only replicate keys starting with `prefix`
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = Some(prefix.into());
        self
    }

    /// Spawns the bridge task. It ends when the room closes or the adapter
    /// stops emitting updates.
    pub fn start(self) -> JoinHandle<()> {
        let mut room_events = self.room.subscribe();
        let mut updates = self.adapter.subscribe();
        info!(room = %self.room.name(), store = %self.adapter.name(), "Starting state sync bridge");

        tokio::spawn(async move {
            let mut state = BridgeState {
                last_synced: StateSnapshot::default(),
                held_remote: None,
            };

            // The room may already be in sync if it was connected earlier
            self.flush(&mut state).await;

            loop {
                tokio::select! {
                    biased;

                    event = room_events.recv() => {
                        if !self.on_room_event(&mut state, event).await {
                            break;
                        }
                    }
                    update = updates.recv() => {
                        let mut relevant = match update {
                            Ok(event) => self.in_scope(&event),
                            Err(RecvError::Lagged(_)) => true,
                            Err(RecvError::Closed) => break,
                        };
                        // Coalesce a burst of writes into one snapshot
                        while let Ok(event) = updates.try_recv() {
                            relevant |= self.in_scope(&event);
                        }

                        // Events the room queued before reaching sync (the
                        // retained backlog) must be merged before publishing
                        if relevant && self.room.state() == ConnectionState::InSync {
                            if !self.drain_room_events(&mut state, &mut room_events).await {
                                break;
                            }
                            self.flush(&mut state).await;
                        }
                    }
                }
            }

            info!(room = %self.room.name(), "State sync bridge stopped");
        })
    }

    /// Handles one room event. Returns false once the room is gone.
    async fn on_room_event(
        &self,
        state: &mut BridgeState,
        event: Result<RoomEvent, RecvError>,
    ) -> bool {
        match event {
            Ok(RoomEvent::Message(message)) => self.on_message(state, message).await,
            Ok(RoomEvent::Sync) => self.flush(state).await,
            Ok(RoomEvent::Disconnect) => state.held_remote = None,
            Ok(RoomEvent::Close) | Err(RecvError::Closed) => return false,
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                warn!(room = %self.room.name(), skipped, "Bridge lagged behind room events");
            }
        }
        true
    }

    async fn drain_room_events(
        &self,
        state: &mut BridgeState,
        room_events: &mut broadcast::Receiver<RoomEvent>,
    ) -> bool {
        loop {
            let event = match room_events.try_recv() {
                Ok(event) => Ok(event),
                Err(TryRecvError::Empty) => return true,
                Err(TryRecvError::Lagged(skipped)) => Err(RecvError::Lagged(skipped)),
                Err(TryRecvError::Closed) => Err(RecvError::Closed),
            };
            if !self.on_room_event(state, event).await {
                return false;
            }
        }
    }

    fn in_scope(&self, event: &UpdateEvent) -> bool {
        match (event.key(), self.key_prefix.as_deref()) {
            (Some(key), Some(prefix)) => key.starts_with(prefix),
            _ => true,
        }
    }

    async fn local_snapshot(&self) -> Result<StateSnapshot, PersistenceError> {
        let mut entries = BTreeMap::new();
        for key in self.adapter.get_all_keys().await? {
            if let Some(prefix) = self.key_prefix.as_deref() {
                if !key.starts_with(prefix) {
                    continue;
                }
            }
            if let Some(value) = self.adapter.get_item(&key).await? {
                entries.insert(key, value);
            }
        }
        Ok(StateSnapshot { entries })
    }

    #[instrument(skip(self, state, message), fields(room = %self.room.name()))]
    async fn on_message(&self, state: &mut BridgeState, message: RoomMessage) {
        let Some(snapshot) = StateSnapshot::from_payload(&message.payload) else {
            debug!("Ignoring non-snapshot payload");
            return;
        };
        let snapshot = snapshot.retain_prefix(self.key_prefix.as_deref());

        if self.room.state() == ConnectionState::InSync {
            state.held_remote = None;
            self.reconcile(state, snapshot).await;
        } else {
            debug!(entries = snapshot.entries.len(), "Holding remote snapshot until sync");
            state.held_remote = Some(snapshot);
        }
    }

    /// Merges `remote` into the store, then publishes if the merge kept any
    /// local change the room has not seen
    async fn reconcile(&self, state: &mut BridgeState, remote: StateSnapshot) {
        let local = match self.local_snapshot().await {
            Ok(local) => local,
            Err(e) => {
                warn!(room = %self.room.name(), error = %e, "Failed to read local snapshot");
                return;
            }
        };
        let merged = merge_snapshots(&state.last_synced, &local, &remote);

        match self.apply(&local, &merged).await {
            Ok(changed) => {
                debug!(
                    room = %self.room.name(),
                    changed,
                    entries = merged.entries.len(),
                    "Merged remote snapshot"
                );
                state.last_synced = remote;
                self.publish_local(state).await;
            }
            Err(e) => warn!(room = %self.room.name(), error = %e, "Failed to apply remote snapshot"),
        }
    }

    /// Writes the difference between `local` and `target` into the store.
    /// Returns the number of keys touched.
    async fn apply(
        &self,
        local: &StateSnapshot,
        target: &StateSnapshot,
    ) -> Result<usize, PersistenceError> {
        let mut changed = 0;

        for key in local.entries.keys() {
            if !target.entries.contains_key(key) {
                self.adapter.remove_item(key).await?;
                changed += 1;
            }
        }
        for (key, value) in &target.entries {
            if local.entries.get(key) != Some(value) {
                self.adapter.set_item(key, value.clone()).await?;
                changed += 1;
            }
        }
        Ok(changed)
    }

    /// Merges a held remote snapshot, if any, then publishes local changes.
    /// Does nothing until the room is in sync.
    #[instrument(skip(self, state), fields(room = %self.room.name()))]
    async fn flush(&self, state: &mut BridgeState) {
        if self.room.state() != ConnectionState::InSync {
            return;
        }
        match state.held_remote.take() {
            Some(remote) => self.reconcile(state, remote).await,
            None => self.publish_local(state).await,
        }
    }

    async fn publish_local(&self, state: &mut BridgeState) {
        // Picked up again at the next `sync`
        if self.room.state() != ConnectionState::InSync {
            return;
        }

        let snapshot = match self.local_snapshot().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(room = %self.room.name(), error = %e, "Failed to read local snapshot");
                return;
            }
        };
        if snapshot == state.last_synced {
            return;
        }

        match self.room.send(snapshot.to_payload(), SendOptions::retained()) {
            Ok(()) => {
                debug!(room = %self.room.name(), entries = snapshot.entries.len(), "Published local snapshot");
                state.last_synced = snapshot;
            }
            Err(e) => warn!(room = %self.room.name(), error = %e, "Failed to publish snapshot"),
        }
    }
}
