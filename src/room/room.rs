use chrono::Utc;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::errors::RoomError;
use super::events::{RoomEvent, RoomFailure, RoomMessage};
use super::messages::{self, Envelope, Incoming, PresenceStatus};
use super::models::{topic_for, ConnectionState, RoomName};
use super::presence::Presence;
use crate::broker::{BrokerEvent, BrokerSession, BrokerTransport, OutboundMessage, SessionOptions};
use crate::config::RoomConfig;

/// Options for [`Room::send`]
#[derive(Debug, Clone, Copy, Default)]
pub struct SendOptions {
    /// Ask the broker to replay this payload to future subscribers
    pub retain: bool,
}

impl SendOptions {
    pub fn retained() -> Self {
        Self { retain: true }
    }
}

enum RoomCommand {
    Publish(OutboundMessage),
    Disconnect(oneshot::Sender<()>),
    Close(oneshot::Sender<()>),
}

struct DriverHandle {
    id: u64,
    commands: mpsc::UnboundedSender<RoomCommand>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State shared between a room and its session driver
struct RoomShared {
    state: watch::Sender<ConnectionState>,
    /// `None` once the room is closed
    events: Mutex<Option<broadcast::Sender<RoomEvent>>>,
    presence: Mutex<Presence>,
    last_message: Mutex<Option<RoomMessage>>,
    /// The running session driver, if any
    driver: Mutex<Option<DriverHandle>>,
    next_driver_id: AtomicU64,
    closing: AtomicBool,
    /// Set by `disconnect`, cleared by `connect`
    disconnect_requested: AtomicBool,
}

impl RoomShared {
    fn emit(&self, event: RoomEvent) {
        if let Some(sender) = lock(&self.events).as_ref() {
            // No receivers is fine
            let _ = sender.send(event);
        }
    }

    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Moves to `to` unless the room is closed. Returns false if closed.
    fn transition(&self, to: ConnectionState) -> bool {
        let mut applied = false;
        self.state.send_if_modified(|state| {
            if state.is_terminal() {
                return false;
            }
            applied = true;
            let changed = *state != to;
            *state = to;
            changed
        });
        applied
    }

    /// Enters the terminal state once; later calls do nothing
    fn finish_closed(&self) -> bool {
        let closed = self.state.send_if_modified(|state| {
            if state.is_terminal() {
                return false;
            }
            *state = ConnectionState::Closed;
            true
        });
        if closed {
            self.closing.store(true, Ordering::SeqCst);
            lock(&self.presence).reset();
            self.emit(RoomEvent::Close);
            lock(&self.events).take();
        }
        closed
    }

    fn participant_count(&self) -> usize {
        lock(&self.presence).count()
    }
}

/// A pub/sub session on one broker topic
///
/// The room owns no socket directly: `connect` spawns a session driver task
/// that opens a broker session, subscribes to the room topic and runs until
/// the session ends. Callers observe the room through [`subscribe`](Self::subscribe)
/// (lifecycle and message events) and [`watch_state`](Self::watch_state).
///
/// A disconnected room keeps its name, topic and last message and can
/// connect again. A closed room is finished for good.
pub struct Room {
    name: String,
    topic: String,
    session_id: String,
    keep_alive: Duration,
    transport: Arc<dyn BrokerTransport>,
    shared: Arc<RoomShared>,
}

impl Room {
    pub fn new(
        name: impl Into<String>,
        transport: Arc<dyn BrokerTransport>,
        config: &RoomConfig,
    ) -> Self {
        let name = name.into();
        let topic = topic_for(&config.topic_prefix, &name);

        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(config.event_capacity.max(1));

        Self {
            name,
            topic,
            session_id: Uuid::new_v4().to_string(),
            keep_alive: config.keep_alive(),
            transport,
            shared: Arc::new(RoomShared {
                state,
                events: Mutex::new(Some(events)),
                presence: Mutex::new(Presence::default()),
                last_message: Mutex::new(None),
                driver: Mutex::new(None),
                next_driver_id: AtomicU64::new(0),
                closing: AtomicBool::new(false),
                disconnect_requested: AtomicBool::new(false),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Unique per room instance; also used as the broker client id
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Sessions currently present on the topic, this one included
    pub fn participant_count(&self) -> usize {
        self.shared.participant_count()
    }

    pub fn last_message(&self) -> Option<RoomMessage> {
        lock(&self.shared.last_message).clone()
    }

    /// True after [`disconnect`](Self::disconnect) until the next `connect`.
    /// Sessions that end on their own leave this false.
    pub fn disconnect_requested(&self) -> bool {
        self.shared.disconnect_requested.load(Ordering::SeqCst)
    }

    /// Subscribe to room events. After the room is closed the returned
    /// receiver is already ended.
    pub fn subscribe(&self) -> broadcast::Receiver<RoomEvent> {
        match lock(&self.shared.events).as_ref() {
            Some(sender) => sender.subscribe(),
            None => broadcast::channel(1).1,
        }
    }

    /// Starts connecting to the broker
    ///
    /// The name is validated first; an invalid name fails here without
    /// touching the network or the connection state. Returns immediately
    /// once the session driver is started. Does nothing if a session is
    /// already running.
    #[instrument(skip(self), fields(room = %self.name))]
    pub fn connect(&self) -> Result<(), RoomError> {
        let mut driver = lock(&self.shared.driver);

        if self.shared.closing.load(Ordering::SeqCst) || self.state().is_terminal() {
            return Err(RoomError::Closed);
        }
        self.shared.disconnect_requested.store(false, Ordering::SeqCst);
        if driver.is_some() {
            debug!("Session already active");
            return Ok(());
        }

        let name = RoomName::parse(&self.name)?;

        let id = self.shared.next_driver_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        *driver = Some(DriverHandle {
            id,
            commands: commands_tx,
        });
        self.shared.transition(ConnectionState::Connecting);
        info!(topic = %self.topic, "Room connecting");

        let session = SessionDriver {
            id,
            name,
            topic: self.topic.clone(),
            session_id: self.session_id.clone(),
            keep_alive: self.keep_alive,
            transport: self.transport.clone(),
            shared: self.shared.clone(),
            probe: None,
        };
        tokio::spawn(session.run(commands_rx));

        Ok(())
    }

    /// Publishes `payload` on the room topic without waiting for delivery
    pub fn send(&self, payload: Value, options: SendOptions) -> Result<(), RoomError> {
        if self.shared.closing.load(Ordering::SeqCst) {
            return Err(RoomError::Closed);
        }
        if !self.state().is_connected() {
            return Err(RoomError::NotConnected);
        }

        let envelope = Envelope::Data {
            session: self.session_id.clone(),
            payload,
        };
        let message = OutboundMessage::new(self.topic.clone(), envelope.encode()?, options.retain);

        match lock(&self.shared.driver).as_ref() {
            Some(handle) => handle
                .commands
                .send(RoomCommand::Publish(message))
                .map_err(|_| RoomError::NotConnected),
            None => Err(RoomError::NotConnected),
        }
    }

    /// Ends the current session, keeping the room reconnectable
    #[instrument(skip(self), fields(room = %self.name))]
    pub async fn disconnect(&self) {
        self.shared.disconnect_requested.store(true, Ordering::SeqCst);
        let handle = lock(&self.shared.driver).take();
        let Some(handle) = handle else {
            debug!("No active session to disconnect");
            return;
        };

        let (ack, done) = oneshot::channel();
        if handle.commands.send(RoomCommand::Disconnect(ack)).is_ok() {
            let _ = done.await;
        }
    }

    /// Tears the room down for good
    ///
    /// Unsubscribes, releases the broker session, then moves to `closed` and
    /// emits `close`. Closing twice is harmless.
    #[instrument(skip(self), fields(room = %self.name))]
    pub async fn close(&self) {
        let handle = {
            let mut driver = lock(&self.shared.driver);
            self.shared.closing.store(true, Ordering::SeqCst);
            driver.take()
        };

        let acknowledged = match handle {
            Some(handle) => {
                let (ack, done) = oneshot::channel();
                handle.commands.send(RoomCommand::Close(ack)).is_ok() && done.await.is_ok()
            }
            None => false,
        };

        if !acknowledged && self.shared.finish_closed() {
            info!("Room closed");
        }
    }
}

impl Drop for Room {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.shared.driver).take() {
            let (ack, _) = oneshot::channel();
            let _ = handle.commands.send(RoomCommand::Disconnect(ack));
        }
    }
}

/// How a session ended
enum SessionEnd {
    Disconnected(Option<oneshot::Sender<()>>),
    Dropped,
    Closed(oneshot::Sender<()>),
    Failed(RoomError),
}

/// Owns one broker session for a room
struct SessionDriver {
    id: u64,
    name: RoomName,
    topic: String,
    session_id: String,
    keep_alive: Duration,
    transport: Arc<dyn BrokerTransport>,
    shared: Arc<RoomShared>,
    /// Nonce of the probe marking the end of the retained backlog
    probe: Option<String>,
}

impl SessionDriver {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<RoomCommand>) {
        let end = self.drive(&mut commands).await;
        self.finish(end);
    }

    fn presence(&self, status: PresenceStatus) -> Result<OutboundMessage, RoomError> {
        let envelope = Envelope::Presence {
            session: self.session_id.clone(),
            status,
        };
        Ok(OutboundMessage::new(
            self.topic.clone(),
            envelope.encode()?,
            false,
        ))
    }

    async fn drive(&mut self, commands: &mut mpsc::UnboundedReceiver<RoomCommand>) -> SessionEnd {
        let last_will = match self.presence(PresenceStatus::Leave) {
            Ok(message) => message,
            Err(error) => return SessionEnd::Failed(error),
        };
        let options = SessionOptions {
            client_id: self.session_id.clone(),
            keep_alive: self.keep_alive,
            last_will: Some(last_will),
        };

        let transport = self.transport.clone();
        let open = transport.open(options);
        tokio::pin!(open);
        let mut session = loop {
            tokio::select! {
                result = &mut open => match result {
                    Ok(session) => break session,
                    Err(error) => return SessionEnd::Failed(error.into()),
                },
                command = commands.recv() => match command {
                    Some(RoomCommand::Publish(_)) => debug!(room = %self.name, "Dropping publish before connect"),
                    Some(RoomCommand::Disconnect(ack)) => return SessionEnd::Disconnected(Some(ack)),
                    Some(RoomCommand::Close(ack)) => return SessionEnd::Closed(ack),
                    None => return SessionEnd::Disconnected(None),
                },
            }
        };

        loop {
            tokio::select! {
                event = session.events.recv() => match event {
                    Some(Ok(event)) => {
                        if let Err(error) = self.on_broker_event(&session, event).await {
                            if !error.is_fatal() {
                                self.leave(&session).await;
                            }
                            return SessionEnd::Failed(error);
                        }
                    }
                    Some(Err(error)) => return SessionEnd::Failed(error.into()),
                    None => return SessionEnd::Dropped,
                },
                command = commands.recv() => match command {
                    Some(RoomCommand::Publish(message)) => {
                        if let Err(error) = session.sink.publish(message).await {
                            warn!(room = %self.name, error = %error, "Publish failed");
                        }
                    }
                    Some(RoomCommand::Disconnect(ack)) => {
                        self.leave(&session).await;
                        return SessionEnd::Disconnected(Some(ack));
                    }
                    Some(RoomCommand::Close(ack)) => {
                        self.leave(&session).await;
                        return SessionEnd::Closed(ack);
                    }
                    None => {
                        self.leave(&session).await;
                        return SessionEnd::Disconnected(None);
                    }
                },
            }
        }
    }

    async fn on_broker_event(
        &mut self,
        session: &BrokerSession,
        event: BrokerEvent,
    ) -> Result<(), RoomError> {
        match event {
            BrokerEvent::Connected => {
                debug!(room = %self.name, topic = %self.topic, "Session open, subscribing");
                session.sink.subscribe(&self.topic).await?;
            }
            BrokerEvent::Subscribed => {
                if self.shared.transition(ConnectionState::Connected) {
                    info!(room = %self.name, "Room connected");
                    self.shared.emit(RoomEvent::Connect);
                }
                if lock(&self.shared.presence).join(&self.session_id) {
                    self.emit_presence();
                }
                session
                    .sink
                    .publish(self.presence(PresenceStatus::Hello)?)
                    .await?;

                let nonce = Uuid::new_v4().to_string();
                let probe = Envelope::Probe {
                    session: self.session_id.clone(),
                    nonce: nonce.clone(),
                };
                self.probe = Some(nonce);
                session
                    .sink
                    .publish(OutboundMessage::new(
                        self.topic.clone(),
                        probe.encode()?,
                        false,
                    ))
                    .await?;
            }
            BrokerEvent::Message(message) => {
                if message.topic != self.topic {
                    return Ok(());
                }
                match messages::decode(&message.payload)? {
                    Some(Incoming::Envelope(envelope)) => {
                        self.on_envelope(session, envelope, message.retained).await?
                    }
                    Some(Incoming::Foreign(payload)) => self.deliver(payload, message.retained, None),
                    None => debug!(room = %self.name, "Ignoring empty payload"),
                }
            }
        }
        Ok(())
    }

    async fn on_envelope(
        &mut self,
        session: &BrokerSession,
        envelope: Envelope,
        retained: bool,
    ) -> Result<(), RoomError> {
        match envelope {
            Envelope::Data { session: sender, payload } => {
                if sender != self.session_id {
                    self.deliver(payload, retained, Some(sender));
                }
            }
            Envelope::Probe { session: sender, nonce } => {
                if sender == self.session_id && self.probe.as_deref() == Some(nonce.as_str()) {
                    self.probe = None;
                    if self.shared.state() == ConnectionState::Connected
                        && self.shared.transition(ConnectionState::InSync)
                    {
                        info!(room = %self.name, "Room in sync");
                        self.shared.emit(RoomEvent::Sync);
                    }
                }
            }
            Envelope::Presence { session: sender, status } => {
                if sender == self.session_id {
                    return Ok(());
                }
                let changed = {
                    let mut presence = lock(&self.shared.presence);
                    match status {
                        PresenceStatus::Hello | PresenceStatus::Here => presence.join(&sender),
                        PresenceStatus::Leave => presence.leave(&sender),
                    }
                };
                if status == PresenceStatus::Hello {
                    session
                        .sink
                        .publish(self.presence(PresenceStatus::Here)?)
                        .await?;
                }
                if changed {
                    debug!(room = %self.name, peer = %sender, status = ?status, "Presence changed");
                    self.emit_presence();
                }
            }
        }
        Ok(())
    }

    fn deliver(&self, payload: Value, retained: bool, sender: Option<String>) {
        let message = RoomMessage {
            payload,
            retained,
            sender,
            received_at: Utc::now(),
        };
        *lock(&self.shared.last_message) = Some(message.clone());
        self.shared.emit(RoomEvent::Message(message));
    }

    fn emit_presence(&self) {
        self.shared.emit(RoomEvent::Presence {
            participants: self.shared.participant_count(),
        });
    }

    /// Announces departure and releases the session cleanly
    async fn leave(&self, session: &BrokerSession) {
        match self.presence(PresenceStatus::Leave) {
            Ok(message) => {
                if let Err(error) = session.sink.publish(message).await {
                    debug!(room = %self.name, error = %error, "Could not announce leave");
                }
            }
            Err(error) => debug!(room = %self.name, error = %error, "Could not encode leave"),
        }
        if let Err(error) = session.sink.unsubscribe(&self.topic).await {
            debug!(room = %self.name, error = %error, "Unsubscribe failed");
        }
        if let Err(error) = session.sink.disconnect().await {
            debug!(room = %self.name, error = %error, "Disconnect failed");
        }
    }

    fn finish(&self, end: SessionEnd) {
        let mut driver = lock(&self.shared.driver);
        let superseded = matches!(driver.as_ref(), Some(handle) if handle.id != self.id);
        if superseded {
            debug!(room = %self.name, "Session superseded");
            drop(driver);
            match end {
                SessionEnd::Disconnected(Some(ack)) | SessionEnd::Closed(ack) => {
                    let _ = ack.send(());
                }
                _ => {}
            }
            return;
        }
        *driver = None;
        lock(&self.shared.presence).reset();

        match end {
            SessionEnd::Disconnected(ack) => {
                self.disconnected(ConnectionState::Disconnected, "Room disconnected");
                drop(driver);
                if let Some(ack) = ack {
                    let _ = ack.send(());
                }
            }
            SessionEnd::Dropped => {
                self.disconnected(ConnectionState::Disconnected, "Broker dropped the session");
            }
            SessionEnd::Closed(ack) => {
                self.shared.finish_closed();
                info!(room = %self.name, "Room closed");
                drop(driver);
                let _ = ack.send(());
            }
            SessionEnd::Failed(error) => {
                let fatal = error.is_fatal();
                warn!(room = %self.name, error = %error, fatal, "Room session failed");
                self.shared.emit(RoomEvent::Error(RoomFailure {
                    detail: error.to_string(),
                    fatal,
                }));
                if fatal {
                    self.shared.finish_closed();
                } else {
                    self.disconnected(ConnectionState::Error, "Room session ended with an error");
                }
            }
        }
    }

    fn disconnected(&self, state: ConnectionState, message: &str) {
        if self.shared.transition(state) {
            info!(room = %self.name, state = %state, "{}", message);
            self.shared.emit(RoomEvent::Disconnect);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{InMemoryBroker, TransportError};
    use serde_json::json;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);

    fn room(broker: &InMemoryBroker, name: &str) -> Room {
        Room::new(name, Arc::new(broker.clone()), &RoomConfig::default())
    }

    async fn wait_for(room: &Room, target: ConnectionState) {
        let mut state = room.watch_state();
        timeout(WAIT, state.wait_for(|s| *s == target))
            .await
            .expect("timed out waiting for room state")
            .expect("state channel closed");
    }

    async fn next_event(events: &mut broadcast::Receiver<RoomEvent>) -> RoomEvent {
        timeout(WAIT, events.recv())
            .await
            .expect("timed out waiting for room event")
            .expect("event channel closed")
    }

    /// Connects and consumes events up to and including `sync`
    async fn connect_in_sync(room: &Room) -> broadcast::Receiver<RoomEvent> {
        let mut events = room.subscribe();
        room.connect().unwrap();
        while next_event(&mut events).await != RoomEvent::Sync {}
        events
    }

    #[tokio::test]
    async fn test_invalid_name_fails_before_network() {
        let broker = InMemoryBroker::new();
        let room = room(&broker, "bad/name");

        let result = room.connect();

        assert!(matches!(result, Err(RoomError::InvalidName { .. })));
        assert_eq!(room.state(), ConnectionState::Disconnected);
        assert_eq!(broker.session_count(), 0);
    }

    #[test]
    fn test_topic_follows_configured_prefix() {
        let broker = InMemoryBroker::new();
        let config = RoomConfig {
            topic_prefix: "desk/rooms/".to_string(),
            ..RoomConfig::default()
        };
        let room = Room::new("abc", Arc::new(broker), &config);

        let name = RoomName::parse("abc").unwrap();
        assert_eq!(room.topic(), name.topic(&config.topic_prefix));
        assert_eq!(room.topic(), "desk/rooms/abc");
    }

    #[tokio::test]
    async fn test_connect_reaches_in_sync() {
        let broker = InMemoryBroker::new();
        let room = room(&broker, "abc-123");
        let mut events = room.subscribe();

        room.connect().unwrap();
        assert_eq!(room.state(), ConnectionState::Connecting);

        assert_eq!(next_event(&mut events).await, RoomEvent::Connect);
        assert_eq!(
            next_event(&mut events).await,
            RoomEvent::Presence { participants: 1 }
        );
        assert_eq!(next_event(&mut events).await, RoomEvent::Sync);
        assert_eq!(room.state(), ConnectionState::InSync);
        assert_eq!(room.topic(), "ticker-sync/rooms/abc-123");
    }

    #[tokio::test]
    async fn test_retained_backlog_arrives_before_sync() {
        let broker = InMemoryBroker::new();
        broker.publish(OutboundMessage::new(
            "ticker-sync/rooms/abc-123",
            br#"{"foo":"bar"}"#.to_vec(),
            true,
        ));
        let room = room(&broker, "abc-123");
        let mut events = room.subscribe();

        room.connect().unwrap();

        let mut names = Vec::new();
        loop {
            let event = next_event(&mut events).await;
            names.push(event.event_name());
            if let RoomEvent::Message(message) = &event {
                assert_eq!(message.payload, json!({"foo": "bar"}));
                assert!(message.retained);
                assert_eq!(message.sender, None);
            }
            if event == RoomEvent::Sync {
                break;
            }
        }
        assert_eq!(names, vec!["connect", "presence", "message", "sync"]);
        assert_eq!(
            room.last_message().map(|m| m.payload),
            Some(json!({"foo": "bar"}))
        );
    }

    #[tokio::test]
    async fn test_send_requires_connection() {
        let broker = InMemoryBroker::new();
        let room = room(&broker, "abc");

        assert_eq!(
            room.send(json!(1), SendOptions::default()),
            Err(RoomError::NotConnected)
        );
    }

    #[tokio::test]
    async fn test_peers_receive_data_but_not_own_echo() {
        let broker = InMemoryBroker::new();
        let alice = room(&broker, "shared");
        let bob = room(&broker, "shared");
        alice.connect().unwrap();
        bob.connect().unwrap();
        wait_for(&alice, ConnectionState::InSync).await;
        wait_for(&bob, ConnectionState::InSync).await;

        let mut alice_events = alice.subscribe();
        let mut bob_events = bob.subscribe();
        alice.send(json!({"n": 1}), SendOptions::default()).unwrap();

        loop {
            if let RoomEvent::Message(message) = next_event(&mut bob_events).await {
                assert_eq!(message.payload, json!({"n": 1}));
                assert_eq!(message.sender.as_deref(), Some(alice.session_id()));
                break;
            }
        }

        bob.send(json!({"n": 2}), SendOptions::default()).unwrap();
        loop {
            if let RoomEvent::Message(message) = next_event(&mut alice_events).await {
                // Alice's own message never comes back to her
                assert_eq!(message.payload, json!({"n": 2}));
                break;
            }
        }
    }

    #[tokio::test]
    async fn test_disconnect_keeps_room_reconnectable() {
        let broker = InMemoryBroker::new();
        let room = room(&broker, "abc");
        let mut events = connect_in_sync(&room).await;

        room.disconnect().await;

        assert_eq!(room.state(), ConnectionState::Disconnected);
        assert_eq!(next_event(&mut events).await, RoomEvent::Disconnect);
        assert_eq!(room.participant_count(), 0);
        assert_eq!(broker.session_count(), 0);
        let leave = Envelope::Presence {
            session: room.session_id().to_string(),
            status: PresenceStatus::Leave,
        }
        .encode()
        .unwrap();
        assert!(broker
            .published()
            .iter()
            .any(|message| message.payload == leave && !message.retain));

        assert!(room.disconnect_requested());

        room.connect().unwrap();
        assert!(!room.disconnect_requested());
        wait_for(&room, ConnectionState::InSync).await;
    }

    #[tokio::test]
    async fn test_broker_drop_disconnects() {
        let broker = InMemoryBroker::new();
        let room = room(&broker, "abc");
        room.connect().unwrap();
        wait_for(&room, ConnectionState::InSync).await;

        assert!(broker.drop_session(room.session_id()));

        wait_for(&room, ConnectionState::Disconnected).await;
        assert!(!room.disconnect_requested());
        room.connect().unwrap();
        wait_for(&room, ConnectionState::InSync).await;
    }

    #[tokio::test]
    async fn test_close_is_terminal() {
        let broker = InMemoryBroker::new();
        let room = room(&broker, "abc");
        let mut events = connect_in_sync(&room).await;

        room.close().await;

        assert_eq!(room.state(), ConnectionState::Closed);
        assert_eq!(next_event(&mut events).await, RoomEvent::Close);
        assert!(matches!(
            events.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
        assert!(matches!(
            room.subscribe().recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
        assert_eq!(room.connect(), Err(RoomError::Closed));
        assert_eq!(broker.subscriber_count(room.topic()), 0);

        // Closing again is harmless
        room.close().await;
    }

    #[tokio::test]
    async fn test_close_without_session() {
        let broker = InMemoryBroker::new();
        let room = room(&broker, "abc");
        let mut events = room.subscribe();

        room.close().await;

        assert_eq!(room.state(), ConnectionState::Closed);
        assert_eq!(next_event(&mut events).await, RoomEvent::Close);
    }

    #[tokio::test]
    async fn test_unreachable_broker_is_recoverable() {
        let broker = InMemoryBroker::new();
        broker.refuse_connections(Some(TransportError::Unreachable("down".into())));
        let room = room(&broker, "abc");
        let mut events = room.subscribe();

        room.connect().unwrap();

        match next_event(&mut events).await {
            RoomEvent::Error(failure) => assert!(!failure.fatal),
            other => panic!("expected error, got {:?}", other),
        }
        assert_eq!(next_event(&mut events).await, RoomEvent::Disconnect);
        assert_eq!(room.state(), ConnectionState::Error);

        broker.refuse_connections(None);
        room.connect().unwrap();
        wait_for(&room, ConnectionState::InSync).await;
    }

    #[tokio::test]
    async fn test_transport_failure_mid_session_is_recoverable() {
        let broker = InMemoryBroker::new();
        let room = room(&broker, "abc");
        let mut events = connect_in_sync(&room).await;

        broker.fail_session(room.session_id(), TransportError::Unreachable("reset".into()));

        match next_event(&mut events).await {
            RoomEvent::Error(failure) => {
                assert!(!failure.fatal);
                assert!(failure.detail.contains("reset"));
            }
            other => panic!("expected error, got {:?}", other),
        }
        assert_eq!(next_event(&mut events).await, RoomEvent::Disconnect);
        assert_eq!(room.state(), ConnectionState::Error);
    }

    #[tokio::test]
    async fn test_auth_rejection_closes_room() {
        let broker = InMemoryBroker::new();
        broker.refuse_connections(Some(TransportError::AuthRejected("nope".into())));
        let room = room(&broker, "abc");
        let mut events = room.subscribe();

        room.connect().unwrap();

        match next_event(&mut events).await {
            RoomEvent::Error(failure) => assert!(failure.fatal),
            other => panic!("expected error, got {:?}", other),
        }
        assert_eq!(next_event(&mut events).await, RoomEvent::Close);
        assert_eq!(room.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_malformed_payload_errors_and_disconnects() {
        let broker = InMemoryBroker::new();
        let room = room(&broker, "abc");
        let mut events = connect_in_sync(&room).await;

        broker.publish(OutboundMessage::new(room.topic(), b"{oops".to_vec(), false));

        assert!(matches!(next_event(&mut events).await, RoomEvent::Error(_)));
        assert_eq!(next_event(&mut events).await, RoomEvent::Disconnect);
        assert_eq!(room.state(), ConnectionState::Error);
    }

    #[tokio::test]
    async fn test_presence_counts_peers_once() {
        let broker = InMemoryBroker::new();
        let alice = room(&broker, "abc");
        let bob = room(&broker, "abc");
        alice.connect().unwrap();
        wait_for(&alice, ConnectionState::InSync).await;
        bob.connect().unwrap();
        wait_for(&bob, ConnectionState::InSync).await;

        let mut events = alice.subscribe();
        // A duplicate hello from bob does not change the count
        let hello = Envelope::Presence {
            session: bob.session_id().to_string(),
            status: PresenceStatus::Hello,
        };
        broker.publish(OutboundMessage::new(alice.topic(), hello.encode().unwrap(), false));

        bob.send(json!("marker"), SendOptions::default()).unwrap();
        loop {
            match next_event(&mut events).await {
                RoomEvent::Message(_) => break,
                RoomEvent::Presence { participants } => assert_eq!(participants, 2),
                _ => {}
            }
        }
        assert_eq!(alice.participant_count(), 2);

        bob.close().await;
        loop {
            if let RoomEvent::Presence { participants } = next_event(&mut events).await {
                assert_eq!(participants, 1);
                break;
            }
        }
        assert_eq!(alice.participant_count(), 1);
    }
}
