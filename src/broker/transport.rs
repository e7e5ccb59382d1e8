use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors reported by a broker transport
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransportError {
    #[error("Broker unreachable: {0}")]
    Unreachable(String),

    #[error("Broker rejected credentials: {0}")]
    AuthRejected(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Session closed")]
    Closed,
}

impl TransportError {
    /// Whether retrying with the same settings is pointless
    pub fn is_fatal(&self) -> bool {
        matches!(self, TransportError::AuthRejected(_))
    }
}

/// A message to publish on a topic
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

impl OutboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>, retain: bool) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            retain,
        }
    }
}

/// A message delivered to a subscribed session
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    /// Set when the broker replayed a stored retained message on subscribe
    pub retained: bool,
}

/// Notifications a session receives from the broker
#[derive(Debug, Clone, PartialEq)]
pub enum BrokerEvent {
    /// The broker accepted the connection
    Connected,
    /// The broker acknowledged a subscription
    Subscribed,
    Message(InboundMessage),
}

/// Parameters for opening a broker session
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub client_id: String,
    pub keep_alive: Duration,
    /// Published by the broker if the session drops without a clean disconnect
    pub last_will: Option<OutboundMessage>,
}

/// Outbound half of a session
#[async_trait]
pub trait BrokerSink: Send + Sync {
    async fn subscribe(&self, topic: &str) -> Result<(), TransportError>;

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError>;

    async fn publish(&self, message: OutboundMessage) -> Result<(), TransportError>;

    /// Clean disconnect; the broker discards the last will
    async fn disconnect(&self) -> Result<(), TransportError>;
}

/// An open broker session
///
/// The event stream ends (`recv` yields `None`) when the broker drops the
/// session. A transport failure is delivered as one `Err` item.
pub struct BrokerSession {
    pub sink: Box<dyn BrokerSink>,
    pub events: mpsc::UnboundedReceiver<Result<BrokerEvent, TransportError>>,
}

/// Factory for broker sessions, one per room
#[async_trait]
pub trait BrokerTransport: Send + Sync {
    async fn open(&self, options: SessionOptions) -> Result<BrokerSession, TransportError>;
}
