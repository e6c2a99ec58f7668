use async_trait::async_trait;
use log::{debug, error, info, warn};
use rumqttc::{
    AsyncClient, Event, EventLoop, LastWill, MqttOptions, Packet, QoS, TlsConfiguration,
    Transport as MqttTransport,
};
use std::path::PathBuf;
use thiserror::Error;
use tokio::time::{timeout, Duration};

use crate::models::DeviceIdentity;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connecting to the broker failed: {0}")]
    Connect(String),
    #[error("Subscribing to '{topic}' failed: {reason}")]
    Subscribe { topic: String, reason: String },
    #[error("Publishing to '{topic}' failed: {reason}")]
    Publish { topic: String, reason: String },
    #[error("Receiving from the broker failed: {0}")]
    Receive(String),
    #[error("Disconnecting from the broker failed: {0}")]
    Disconnect(String),
    #[error("Transport is not connected.")]
    NotConnected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Will {
    pub topic: String,
    pub payload: String,
    pub retain: bool,
}

/// Publish/subscribe session used by the agent.
#[async_trait]
pub trait Transport: Send {
    /// Opens the session, registering `will` with the broker first.
    async fn connect(&mut self, will: Will) -> Result<(), TransportError>;

    async fn subscribe(&mut self, topic: &str) -> Result<(), TransportError>;

    async fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos: u8,
        retain: bool,
    ) -> Result<(), TransportError>;

    /// Returns at most one pending inbound message without waiting indefinitely.
    async fn try_recv(&mut self) -> Result<Option<InboundMessage>, TransportError>;

    async fn disconnect(&mut self) -> Result<(), TransportError>;
}

#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub port: u16,
    pub ca_path: Option<PathBuf>,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
    pub poll_timeout: Duration,
}

pub fn qos_from_level(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::ExactlyOnce,
    }
}

pub struct MqttService {
    identity: DeviceIdentity,
    settings: MqttSettings,
    client: Option<AsyncClient>,
    eventloop: Option<EventLoop>,
}

impl MqttService {
    pub fn new(identity: DeviceIdentity, settings: MqttSettings) -> Self {
        Self {
            identity,
            settings,
            client: None,
            eventloop: None,
        }
    }

    fn options(&self, will: Will) -> Result<MqttOptions, TransportError> {
        let mut mqtt_options = MqttOptions::new(
            &self.identity.device_id,
            &self.identity.broker,
            self.settings.port,
        );
        mqtt_options.set_keep_alive(self.settings.keep_alive);
        mqtt_options.set_clean_session(true);
        mqtt_options.set_last_will(LastWill::new(
            will.topic,
            will.payload,
            QoS::AtMostOnce,
            will.retain,
        ));

        if let Some(token) = &self.identity.token {
            mqtt_options.set_credentials(&self.identity.device_id, token);
        }

        if let Some(ca_path) = &self.settings.ca_path {
            let ca = std::fs::read(ca_path).map_err(|e| {
                TransportError::Connect(format!(
                    "cannot read CA certificate {}: {}",
                    ca_path.display(),
                    e
                ))
            })?;
            mqtt_options.set_transport(MqttTransport::tls_with_config(
                TlsConfiguration::Simple {
                    ca,
                    alpn: None,
                    client_auth: None,
                },
            ));
        }

        Ok(mqtt_options)
    }

    fn client(&self) -> Result<&AsyncClient, TransportError> {
        self.client.as_ref().ok_or(TransportError::NotConnected)
    }
}

#[async_trait]
impl Transport for MqttService {
    async fn connect(&mut self, will: Will) -> Result<(), TransportError> {
        debug!(
            "Configuring MQTT broker at {}:{}...",
            self.identity.broker, self.settings.port
        );
        let mqtt_options = self.options(will)?;
        let (client, mut eventloop) = AsyncClient::new(mqtt_options, 64);

        let handshake = async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => return Ok(()),
                    Ok(event) => debug!("Event before ConnAck: {:?}", event),
                    Err(e) => return Err(TransportError::Connect(e.to_string())),
                }
            }
        };

        match timeout(self.settings.connect_timeout, handshake).await {
            Ok(Ok(())) => info!("Connected to MQTT broker {}.", self.identity.broker),
            Ok(Err(e)) => {
                error!("{}", e);
                return Err(e);
            }
            Err(_) => {
                error!("Timed out waiting for ConnAck from {}.", self.identity.broker);
                return Err(TransportError::Connect("timed out waiting for ConnAck".into()));
            }
        }

        self.client = Some(client);
        self.eventloop = Some(eventloop);
        Ok(())
    }

    async fn subscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        match self.client()?.subscribe(topic, QoS::AtMostOnce).await {
            Ok(_) => {
                info!("Successfully subscribed to topic '{}'.", topic);
                Ok(())
            }
            Err(e) => Err(TransportError::Subscribe {
                topic: topic.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    async fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos: u8,
        retain: bool,
    ) -> Result<(), TransportError> {
        self.client()?
            .publish(topic, qos_from_level(qos), retain, payload.to_vec())
            .await
            .map_err(|e| TransportError::Publish {
                topic: topic.to_string(),
                reason: e.to_string(),
            })?;
        debug!("Message queued for '{}' ({} bytes).", topic, payload.len());
        Ok(())
    }

    async fn try_recv(&mut self) -> Result<Option<InboundMessage>, TransportError> {
        let eventloop = self.eventloop.as_mut().ok_or(TransportError::NotConnected)?;
        let poll_timeout = self.settings.poll_timeout;

        let next_publish = async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        return Ok(InboundMessage {
                            topic: publish.topic.clone(),
                            payload: publish.payload.to_vec(),
                        })
                    }
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("Reconnected to MQTT broker.");
                    }
                    Ok(Event::Outgoing(_)) => {}
                    Ok(event) => debug!("Unhandled event: {:?}", event),
                    Err(e) => {
                        warn!("Error in MQTT event loop: {:?}", e);
                        return Err(TransportError::Receive(e.to_string()));
                    }
                }
            }
        };

        match timeout(poll_timeout, next_publish).await {
            Ok(result) => result.map(Some),
            Err(_) => Ok(None),
        }
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        let client = self.client.take().ok_or(TransportError::NotConnected)?;
        client
            .disconnect()
            .await
            .map_err(|e| TransportError::Disconnect(e.to_string()))?;

        // Drive the event loop so the DISCONNECT packet actually leaves.
        if let Some(mut eventloop) = self.eventloop.take() {
            let _ = timeout(self.settings.poll_timeout, eventloop.poll()).await;
        }
        info!("Disconnected from MQTT broker.");
        Ok(())
    }
}
