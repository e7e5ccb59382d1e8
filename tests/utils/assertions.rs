//! Test assertion helpers - waiting on asynchronous room and coordinator state
#![allow(dead_code)] // Test utilities may not all be used in every test

use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::timeout;

use serde_json::Value;
use ticker_sync::{
    ConnectionState, CoordinatorStatus, Room, RoomCoordinator, RoomEvent, StatePersistenceAdapter,
};

pub const WAIT: Duration = Duration::from_secs(2);

// ============================================================================
// Assertion Helpers
// ============================================================================

/// Waits until the room reaches `target`
pub async fn wait_for_state(room: &Room, target: ConnectionState) {
    let mut state = room.watch_state();
    let reached = timeout(WAIT, state.wait_for(|s| *s == target))
        .await
        .map(|result| result.is_ok())
        .unwrap_or(false);
    assert!(
        reached,
        "room {} never reached {} (currently {})",
        room.name(),
        target,
        room.state()
    );
}

/// Waits until the coordinator publishes a status matching `check`
pub async fn wait_for_status(
    coordinator: &RoomCoordinator,
    check: impl FnMut(&CoordinatorStatus) -> bool,
) -> CoordinatorStatus {
    let mut status = coordinator.subscribe_status();
    let matched = match timeout(WAIT, status.wait_for(check)).await {
        Ok(Ok(status)) => status.clone(),
        _ => panic!(
            "coordinator status never matched, last: {:?}",
            coordinator.status()
        ),
    };
    matched
}

/// Waits until `store` holds `expected` under `key`
pub async fn wait_for_item(store: &dyn StatePersistenceAdapter, key: &str, expected: Value) {
    let reached = timeout(WAIT, async {
        loop {
            if store.get_item(key).await.ok().flatten().as_ref() == Some(&expected) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .is_ok();
    assert!(
        reached,
        "{} never became {} (currently {:?})",
        key,
        expected,
        store.get_item(key).await
    );
}

/// Records room events in arrival order
pub struct EventLog {
    receiver: broadcast::Receiver<RoomEvent>,
    pub events: Vec<RoomEvent>,
}

impl EventLog {
    pub fn new(room: &Room) -> Self {
        Self {
            receiver: room.subscribe(),
            events: vec![],
        }
    }

    /// Reads events until one named `name` arrives, returning it
    pub async fn until(&mut self, name: &str) -> RoomEvent {
        loop {
            let event = match timeout(WAIT, self.receiver.recv()).await {
                Ok(Ok(event)) => event,
                Ok(Err(e)) => panic!("event stream ended waiting for {}: {}", name, e),
                Err(_) => panic!(
                    "timed out waiting for {}, saw {:?}",
                    name,
                    self.names()
                ),
            };
            self.events.push(event.clone());
            if event.event_name() == name {
                return event;
            }
        }
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.events.iter().map(|e| e.event_name()).collect()
    }

    /// Position of the first recorded event named `name`
    pub fn position(&self, name: &str) -> Option<usize> {
        self.names().iter().position(|n| *n == name)
    }

    /// True once the room has closed its event stream
    pub async fn ended(&mut self) -> bool {
        loop {
            match timeout(WAIT, self.receiver.recv()).await {
                Ok(Ok(event)) => self.events.push(event),
                Ok(Err(broadcast::error::RecvError::Closed)) => return true,
                Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
                Err(_) => return false,
            }
        }
    }
}
