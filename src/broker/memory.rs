use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::transport::{
    BrokerEvent, BrokerSession, BrokerSink, BrokerTransport, InboundMessage, OutboundMessage,
    SessionOptions, TransportError,
};

type EventSender = mpsc::UnboundedSender<Result<BrokerEvent, TransportError>>;

/// In-process broker with MQTT-like semantics
///
/// Supports exact-topic subscriptions, retained messages (an empty retained
/// payload clears the topic), last wills, and client-id takeover. Publishers
/// receive their own messages when subscribed to the topic.
///
/// Also exposes knobs for tests: refusing connections, holding connection
/// handshakes, and dropping or failing individual sessions.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

#[derive(Default)]
struct BrokerState {
    sessions: HashMap<String, SessionEntry>,
    retained: HashMap<String, Vec<u8>>,
    refusal: Option<TransportError>,
    hold_handshakes: bool,
    held: Vec<String>,
    published: Vec<OutboundMessage>,
    next_token: u64,
}

struct SessionEntry {
    token: u64,
    sender: EventSender,
    subscriptions: HashSet<String>,
    last_will: Option<OutboundMessage>,
}

impl BrokerState {
    fn route(&mut self, message: OutboundMessage) {
        if message.retain {
            if message.payload.is_empty() {
                self.retained.remove(&message.topic);
            } else {
                self.retained
                    .insert(message.topic.clone(), message.payload.clone());
            }
        }

        let mut delivered = 0;
        for session in self.sessions.values() {
            if session.subscriptions.contains(&message.topic) {
                let inbound = InboundMessage {
                    topic: message.topic.clone(),
                    payload: message.payload.clone(),
                    retained: false,
                };
                if session.sender.send(Ok(BrokerEvent::Message(inbound))).is_ok() {
                    delivered += 1;
                }
            }
        }

        debug!(
            topic = %message.topic,
            retain = message.retain,
            delivered,
            "Message routed"
        );
        self.published.push(message);
    }

    fn session(&mut self, client_id: &str, token: u64) -> Result<&mut SessionEntry, TransportError> {
        match self.sessions.get_mut(client_id) {
            Some(entry) if entry.token == token => Ok(entry),
            _ => Err(TransportError::Closed),
        }
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publishes as an external client would
    pub fn publish(&self, message: OutboundMessage) {
        self.state().route(message);
    }

    /// Makes new connection attempts fail with `error` until reset with `None`
    pub fn refuse_connections(&self, error: Option<TransportError>) {
        self.state().refusal = error;
    }

    /// Accept new sessions but withhold their connection acknowledgement
    pub fn hold_handshakes(&self) {
        self.state().hold_handshakes = true;
    }

    /// Acknowledge every held session and stop holding new ones
    pub fn release_handshakes(&self) {
        let mut state = self.state();
        state.hold_handshakes = false;
        let held = std::mem::take(&mut state.held);
        for client_id in held {
            if let Some(session) = state.sessions.get(&client_id) {
                let _ = session.sender.send(Ok(BrokerEvent::Connected));
            }
        }
    }

    /// Drops a session as if its network connection died, publishing its last will
    pub fn drop_session(&self, client_id: &str) -> bool {
        let mut state = self.state();
        match state.sessions.remove(client_id) {
            Some(session) => {
                info!(client_id = %client_id, "Dropping session");
                if let Some(will) = session.last_will {
                    state.route(will);
                }
                true
            }
            None => false,
        }
    }

    /// Delivers a transport error to a session and then drops it
    pub fn fail_session(&self, client_id: &str, error: TransportError) -> bool {
        let mut state = self.state();
        match state.sessions.remove(client_id) {
            Some(session) => {
                warn!(client_id = %client_id, error = %error, "Failing session");
                let _ = session.sender.send(Err(error));
                true
            }
            None => false,
        }
    }

    pub fn retained(&self, topic: &str) -> Option<Vec<u8>> {
        self.state().retained.get(topic).cloned()
    }

    pub fn session_count(&self) -> usize {
        self.state().sessions.len()
    }

    pub fn has_session(&self, client_id: &str) -> bool {
        self.state().sessions.contains_key(client_id)
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.state()
            .sessions
            .values()
            .filter(|session| session.subscriptions.contains(topic))
            .count()
    }

    /// Every message routed so far, in order
    pub fn published(&self) -> Vec<OutboundMessage> {
        self.state().published.clone()
    }
}

#[async_trait]
impl BrokerTransport for InMemoryBroker {
    async fn open(&self, options: SessionOptions) -> Result<BrokerSession, TransportError> {
        let mut state = self.state();

        if let Some(error) = state.refusal.clone() {
            warn!(client_id = %options.client_id, error = %error, "Connection refused");
            return Err(error);
        }

        let (sender, events) = mpsc::unbounded_channel();
        if state.sessions.remove(&options.client_id).is_some() {
            debug!(client_id = %options.client_id, "Existing session taken over");
        }

        if state.hold_handshakes {
            state.held.push(options.client_id.clone());
        } else {
            let _ = sender.send(Ok(BrokerEvent::Connected));
        }

        state.next_token += 1;
        let token = state.next_token;
        state.sessions.insert(
            options.client_id.clone(),
            SessionEntry {
                token,
                sender,
                subscriptions: HashSet::new(),
                last_will: options.last_will,
            },
        );

        debug!(client_id = %options.client_id, "Session opened");
        Ok(BrokerSession {
            sink: Box::new(InMemorySink {
                broker: self.clone(),
                client_id: options.client_id,
                token,
            }),
            events,
        })
    }
}

struct InMemorySink {
    broker: InMemoryBroker,
    client_id: String,
    token: u64,
}

#[async_trait]
impl BrokerSink for InMemorySink {
    async fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        let mut state = self.broker.state();
        let retained = state.retained.get(topic).cloned();
        let session = state.session(&self.client_id, self.token)?;

        session.subscriptions.insert(topic.to_string());
        let _ = session.sender.send(Ok(BrokerEvent::Subscribed));
        if let Some(payload) = retained {
            let _ = session
                .sender
                .send(Ok(BrokerEvent::Message(InboundMessage {
                    topic: topic.to_string(),
                    payload,
                    retained: true,
                })));
        }
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        let mut state = self.broker.state();
        state
            .session(&self.client_id, self.token)?
            .subscriptions
            .remove(topic);
        Ok(())
    }

    async fn publish(&self, message: OutboundMessage) -> Result<(), TransportError> {
        let mut state = self.broker.state();
        state.session(&self.client_id, self.token)?;
        state.route(message);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let mut state = self.broker.state();
        state.session(&self.client_id, self.token)?;
        state.sessions.remove(&self.client_id);
        debug!(client_id = %self.client_id, "Session disconnected cleanly");
        Ok(())
    }
}
