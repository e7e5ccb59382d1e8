use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ClientError, ConnectReturnCode, ConnectionError, Event, EventLoop, LastWill,
    MqttOptions, Outgoing, Packet, QoS, SubscribeReasonCode,
};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use super::transport::{
    BrokerEvent, BrokerSession, BrokerSink, BrokerTransport, InboundMessage, OutboundMessage,
    SessionOptions, TransportError,
};
use crate::config::BrokerConfig;

/// rumqttc rejects keep-alive intervals below this
const MIN_KEEP_ALIVE: Duration = Duration::from_secs(5);

type EventSender = mpsc::UnboundedSender<Result<BrokerEvent, TransportError>>;

/// MQTT 3.1.1 transport backed by rumqttc
///
/// Each session gets its own client and event loop. The event loop runs on a
/// dedicated task and forwards mapped events over an unbounded channel. It
/// stops at the first connection error instead of reconnecting, so the room
/// above decides whether to retry.
pub struct MqttTransport {
    config: BrokerConfig,
}

impl MqttTransport {
    pub fn new(config: BrokerConfig) -> Self {
        Self { config }
    }

    fn mqtt_options(&self, options: &SessionOptions) -> MqttOptions {
        let mut mqtt_options = MqttOptions::new(
            options.client_id.clone(),
            self.config.host.clone(),
            self.config.port,
        );
        mqtt_options.set_keep_alive(options.keep_alive.max(MIN_KEEP_ALIVE));
        mqtt_options.set_clean_session(true);

        if let (Some(username), Some(password)) = (&self.config.username, &self.config.password) {
            mqtt_options.set_credentials(username.clone(), password.clone());
        }

        if let Some(will) = &options.last_will {
            mqtt_options.set_last_will(LastWill::new(
                will.topic.clone(),
                will.payload.clone(),
                QoS::AtLeastOnce,
                will.retain,
            ));
        }

        mqtt_options
    }
}

#[async_trait]
impl BrokerTransport for MqttTransport {
    #[instrument(skip(self, options), fields(client_id = %options.client_id))]
    async fn open(&self, options: SessionOptions) -> Result<BrokerSession, TransportError> {
        let (client, event_loop) =
            AsyncClient::new(self.mqtt_options(&options), self.config.request_capacity);
        let (sender, events) = mpsc::unbounded_channel();

        info!(
            host = %self.config.host,
            port = self.config.port,
            "Opening MQTT session"
        );
        tokio::spawn(drive_event_loop(options.client_id, event_loop, sender));

        Ok(BrokerSession {
            sink: Box::new(MqttSink { client }),
            events,
        })
    }
}

async fn drive_event_loop(client_id: String, mut event_loop: EventLoop, sender: EventSender) {
    loop {
        let event = match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => Ok(BrokerEvent::Connected),
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                if ack
                    .return_codes
                    .iter()
                    .any(|code| matches!(code, SubscribeReasonCode::Failure))
                {
                    Err(TransportError::Protocol(
                        "broker rejected the subscription".to_string(),
                    ))
                } else {
                    Ok(BrokerEvent::Subscribed)
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                Ok(BrokerEvent::Message(InboundMessage {
                    topic: publish.topic,
                    payload: publish.payload.to_vec(),
                    retained: publish.retain,
                }))
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                info!(client_id = %client_id, "Broker closed the session");
                break;
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!(client_id = %client_id, "Clean disconnect sent");
                break;
            }
            Ok(_) => continue,
            Err(error) => Err(map_connection_error(error)),
        };

        if let Err(error) = &event {
            warn!(client_id = %client_id, error = %error, "MQTT session failed");
        }
        let failed = event.is_err();
        if sender.send(event).is_err() {
            debug!(client_id = %client_id, "Room dropped the session");
            break;
        }
        if failed {
            break;
        }
    }

    debug!(client_id = %client_id, "MQTT event loop stopped");
}

fn map_connection_error(error: ConnectionError) -> TransportError {
    match error {
        ConnectionError::ConnectionRefused(
            code @ (ConnectReturnCode::BadUserNamePassword | ConnectReturnCode::NotAuthorized),
        ) => TransportError::AuthRejected(format!("{:?}", code)),
        ConnectionError::ConnectionRefused(code) => {
            TransportError::Unreachable(format!("connection refused: {:?}", code))
        }
        ConnectionError::MqttState(state_error) => {
            TransportError::Protocol(state_error.to_string())
        }
        other => TransportError::Unreachable(other.to_string()),
    }
}

fn map_client_error(error: ClientError) -> TransportError {
    debug!(error = %error, "MQTT request rejected");
    TransportError::Closed
}

struct MqttSink {
    client: AsyncClient,
}

#[async_trait]
impl BrokerSink for MqttSink {
    async fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.client
            .subscribe(topic, QoS::AtLeastOnce)
            .await
            .map_err(map_client_error)
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.client.unsubscribe(topic).await.map_err(map_client_error)
    }

    async fn publish(&self, message: OutboundMessage) -> Result<(), TransportError> {
        self.client
            .publish(
                message.topic,
                QoS::AtLeastOnce,
                message.retain,
                message.payload,
            )
            .await
            .map_err(map_client_error)
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.client.disconnect().await.map_err(map_client_error)
    }
}
