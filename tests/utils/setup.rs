#![allow(dead_code)] // Test utilities may not all be used in every test

use std::sync::Arc;

use ticker_sync::{
    broker::{InMemoryBroker, OutboundMessage, TransportError},
    config::{RoomConfig, SyncConfig},
    persistence::{BaseStatePersistenceAdapter, InMemoryBackend, StatePersistenceAdapter},
    RoomCoordinator, SyncContext,
};

// ============================================================================
// Test Setup Infrastructure
// ============================================================================

pub struct TestSetup {
    pub broker: InMemoryBroker,
    pub coordinator: Arc<RoomCoordinator>,
    pub room_config: RoomConfig,
}

impl TestSetup {
    /// Topic a room with this name uses
    pub fn topic(&self, room: &str) -> String {
        format!("{}/{}", self.room_config.topic_prefix, room)
    }

    /// Publishes a retained payload as an outside client would
    pub fn publish_retained(&self, room: &str, payload: &str) {
        self.broker.publish(OutboundMessage::new(
            self.topic(room),
            payload.as_bytes().to_vec(),
            true,
        ));
    }

    /// A second, independent device on the same broker
    pub fn device(&self) -> SyncContext {
        device_on(&self.broker)
    }
}

/// A sync context with its own in-memory store, sharing `broker`
pub fn device_on(broker: &InMemoryBroker) -> SyncContext {
    let persistence: Arc<dyn StatePersistenceAdapter> = Arc::new(
        BaseStatePersistenceAdapter::new(InMemoryBackend::new("app-state")),
    );
    SyncContext::new(
        Arc::new(broker.clone()),
        persistence,
        &SyncConfig::default(),
    )
}

pub struct TestSetupBuilder {
    retained: Vec<(String, String)>,
    hold_handshakes: bool,
    refusal: Option<TransportError>,
    room_config: RoomConfig,
}

impl TestSetupBuilder {
    pub fn new() -> Self {
        Self {
            retained: vec![],
            hold_handshakes: false,
            refusal: None,
            room_config: RoomConfig::default(),
        }
    }

    /// Seed the broker with a retained payload for `room`
    pub fn with_retained(mut self, room: &str, payload: &str) -> Self {
        self.retained.push((room.to_string(), payload.to_string()));
        self
    }

    /// New sessions wait for `broker.release_handshakes()`
    pub fn with_held_handshakes(mut self) -> Self {
        self.hold_handshakes = true;
        self
    }

    pub fn with_refusal(mut self, error: TransportError) -> Self {
        self.refusal = Some(error);
        self
    }

    pub fn build(self) -> TestSetup {
        let broker = InMemoryBroker::new();
        let coordinator = Arc::new(RoomCoordinator::new(
            Arc::new(broker.clone()),
            self.room_config.clone(),
        ));

        let setup = TestSetup {
            broker,
            coordinator,
            room_config: self.room_config,
        };

        for (room, payload) in &self.retained {
            setup.publish_retained(room, payload);
        }
        if self.hold_handshakes {
            setup.broker.hold_handshakes();
        }
        setup.broker.refuse_connections(self.refusal);

        setup
    }
}

impl Default for TestSetupBuilder {
    fn default() -> Self {
        Self::new()
    }
}
