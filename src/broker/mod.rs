// Broker connectivity
//
// Rooms talk to the broker only through `BrokerTransport`, so the same room
// logic runs over MQTT in production and over the in-process broker in tests.

// Public API - what other modules can use
pub use memory::InMemoryBroker;
pub use mqtt::MqttTransport;
pub use transport::{
    BrokerEvent, BrokerSession, BrokerSink, BrokerTransport, InboundMessage, OutboundMessage,
    SessionOptions, TransportError,
};

// Internal modules
mod memory;
mod mqtt;
mod transport;
