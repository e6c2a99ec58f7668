//! The device agent: one broker session, one device identity.
//!
//! The agent is driven by its owner calling [`DeviceAgent::loop_once`] over and
//! over. Each call handles at most one inbound message, so everything a
//! handler or the firmware pipeline does happens inline on the caller's task.

use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::firmware::{FirmwareUpdater, UpdateOutcome};
use crate::models::{
    metadata_payload, presence_payload, status_log_payload, with_default_pub_interval,
    DeviceIdentity, Envelope, Metadata, MetadataUpdate, PersistedConfig,
    DEFAULT_PUB_INTERVAL_MS, PUB_INTERVAL_KEY,
};
use crate::mqtt_service::{Transport, TransportError, Will};
use crate::service_utils::{AbortSignal, Rebooter};
use crate::store::{ConfigStore, StoreError};
use crate::topics::{TopicError, TopicSet, DEFAULT_PREFIX};

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Topic(#[from] TopicError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("Device identity is invalid: {0}")]
    InvalidIdentity(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Disconnected,
    Connecting,
    Connected,
    /// Connecting failed; a reboot has been requested and the agent does nothing further.
    Faulted,
}

/// User callback invoked with the raw topic and payload.
pub type Handler = Box<dyn FnMut(&str, &[u8]) + Send>;

/// How an inbound message was routed.
#[derive(Debug)]
pub enum Dispatched {
    Reboot,
    FactoryReset,
    /// A well-formed metadata update; `applied` is false when it targeted another field.
    Metadata { applied: bool },
    MetadataRejected,
    FirmwareUpdate(UpdateOutcome),
    Command,
    Ignored,
}

/// Where the agent's identity comes from.
pub enum IdentitySource {
    Explicit(DeviceIdentity),
    Store(Box<dyn ConfigStore>),
}

#[derive(Debug, Clone)]
pub struct EventOptions {
    pub format: String,
    pub qos: u8,
    pub retain: bool,
}

impl Default for EventOptions {
    fn default() -> Self {
        Self {
            format: "json".to_string(),
            qos: 0,
            retain: false,
        }
    }
}

/// Identity and metadata resolved ahead of building the transport.
pub struct AgentBuilder {
    identity: DeviceIdentity,
    meta: Metadata,
    store: Option<Box<dyn ConfigStore>>,
    prefix: String,
    abort: AbortSignal,
}

impl AgentBuilder {
    pub fn new(source: IdentitySource) -> Result<Self, AgentError> {
        let (identity, meta, store) = match source {
            IdentitySource::Explicit(identity) => (identity, Metadata::new(), None),
            IdentitySource::Store(store) => {
                let cfg = store.load()?;
                (cfg.identity(), cfg.meta, Some(store))
            }
        };

        if identity.device_id.is_empty() || identity.broker.is_empty() {
            return Err(AgentError::InvalidIdentity(
                "device id and broker must be non-empty".to_string(),
            ));
        }

        Ok(Self {
            identity,
            meta: with_default_pub_interval(meta),
            store,
            prefix: DEFAULT_PREFIX.to_string(),
            abort: AbortSignal::new(),
        })
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn has_store(&self) -> bool {
        self.store.is_some()
    }

    pub fn topic_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn abort_signal(mut self, abort: AbortSignal) -> Self {
        self.abort = abort;
        self
    }

    pub fn build(
        self,
        transport: Box<dyn Transport>,
        updater: FirmwareUpdater,
        rebooter: Arc<dyn Rebooter>,
    ) -> Result<DeviceAgent, AgentError> {
        let topics = TopicSet::derive_with_prefix(&self.prefix, &self.identity.device_id)?;
        Ok(DeviceAgent {
            identity: self.identity,
            topics,
            meta: self.meta,
            state: AgentState::Disconnected,
            transport,
            store: self.store,
            updater,
            rebooter,
            abort: self.abort,
            reboot_requested: false,
            command_handler: None,
            metadata_handler: None,
            reset_handler: None,
            firmware_handler: None,
        })
    }
}

pub struct DeviceAgent {
    identity: DeviceIdentity,
    topics: TopicSet,
    meta: Metadata,
    state: AgentState,
    transport: Box<dyn Transport>,
    store: Option<Box<dyn ConfigStore>>,
    updater: FirmwareUpdater,
    rebooter: Arc<dyn Rebooter>,
    abort: AbortSignal,
    reboot_requested: bool,
    command_handler: Option<Handler>,
    metadata_handler: Option<Handler>,
    reset_handler: Option<Handler>,
    firmware_handler: Option<Handler>,
}

impl DeviceAgent {
    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn topics(&self) -> &TopicSet {
        &self.topics
    }

    pub fn metadata(&self) -> &Metadata {
        &self.meta
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    /// Publish cadence from `pubInterval`, falling back to the default when it is not a number.
    pub fn pub_interval_ms(&self) -> u64 {
        self.meta
            .get(PUB_INTERVAL_KEY)
            .and_then(|v| v.as_u64())
            .unwrap_or(DEFAULT_PUB_INTERVAL_MS)
    }

    pub fn set_command_handler(&mut self, handler: impl FnMut(&str, &[u8]) + Send + 'static) {
        self.command_handler = Some(Box::new(handler));
    }

    pub fn set_metadata_handler(&mut self, handler: impl FnMut(&str, &[u8]) + Send + 'static) {
        self.metadata_handler = Some(Box::new(handler));
    }

    pub fn set_reset_handler(&mut self, handler: impl FnMut(&str, &[u8]) + Send + 'static) {
        self.reset_handler = Some(Box::new(handler));
    }

    /// Runs before the built-in firmware pipeline; it cannot replace it.
    pub fn set_firmware_update_handler(
        &mut self,
        handler: impl FnMut(&str, &[u8]) + Send + 'static,
    ) {
        self.firmware_handler = Some(Box::new(handler));
    }

    /// Opens the session. Any failure here faults the agent and reboots the device.
    pub async fn connect(&mut self) -> Result<(), AgentError> {
        self.state = AgentState::Connecting;
        match self.open_session().await {
            Ok(()) => {
                self.state = AgentState::Connected;
                info!("Device '{}' is online.", self.identity.device_id);
                Ok(())
            }
            Err(e) => {
                error!("{}", e);
                error!("Fix the connection information and/or certificate if required.");
                self.state = AgentState::Faulted;
                self.request_reboot();
                Err(e.into())
            }
        }
    }

    async fn open_session(&mut self) -> Result<(), TransportError> {
        let connection = self.topics.connection();
        let will = Will {
            topic: connection.clone(),
            payload: presence_payload("offline"),
            retain: true,
        };
        self.transport.connect(will).await?;

        self.transport.subscribe(&self.topics.command).await?;
        for topic in self.topics.control_topics() {
            self.transport.subscribe(topic).await?;
        }

        let online = presence_payload("online");
        self.transport
            .publish(&connection, online.as_bytes(), 0, true)
            .await?;
        self.publish_metadata().await
    }

    /// Polls for one inbound message and dispatches it.
    ///
    /// Returns `false` once the caller should stop looping: the abort signal
    /// was tripped, the agent faulted, or a reboot is pending.
    pub async fn loop_once(&mut self) -> bool {
        if self.state == AgentState::Connected {
            match self.transport.try_recv().await {
                Ok(Some(message)) => {
                    self.dispatch_inbound(&message.topic, &message.payload).await;
                }
                Ok(None) => {}
                Err(e) => debug!("Ignoring transient receive failure: {}", e),
            }
        }
        self.is_alive()
    }

    pub fn is_alive(&self) -> bool {
        !self.abort.is_aborted() && !self.reboot_requested && self.state != AgentState::Faulted
    }

    pub async fn dispatch_inbound(&mut self, topic: &str, payload: &[u8]) -> Dispatched {
        if topic == self.topics.reboot {
            info!("Reboot requested over '{}'.", topic);
            if let Err(e) = self.transport.disconnect().await {
                warn!("Disconnect before reboot failed: {}", e);
            }
            self.state = AgentState::Disconnected;
            self.request_reboot();
            Dispatched::Reboot
        } else if topic == self.topics.reset {
            self.factory_reset().await;
            if let Some(handler) = self.reset_handler.as_mut() {
                handler(topic, payload);
            }
            Dispatched::FactoryReset
        } else if topic == self.topics.update {
            self.update_metadata(topic, payload).await
        } else if topic == self.topics.upgrade {
            if let Some(handler) = self.firmware_handler.as_mut() {
                handler(topic, payload);
            }
            let outcome = self.updater.handle(payload).await;
            match &outcome {
                UpdateOutcome::Installed { .. } => self.reboot_requested = true,
                UpdateOutcome::Aborted(e) => {
                    self.log_status("update_failed", &e.to_string()).await;
                }
            }
            Dispatched::FirmwareUpdate(outcome)
        } else if self.topics.is_command(topic) {
            match self.command_handler.as_mut() {
                Some(handler) => {
                    handler(topic, payload);
                    Dispatched::Command
                }
                None => Dispatched::Ignored,
            }
        } else {
            debug!("Dropping message on unrelated topic '{}'.", topic);
            Dispatched::Ignored
        }
    }

    async fn update_metadata(&mut self, topic: &str, payload: &[u8]) -> Dispatched {
        let update: Envelope<MetadataUpdate> = match serde_json::from_slice(payload) {
            Ok(update) => update,
            Err(e) => {
                warn!("Malformed metadata update ignored: {}", e);
                return Dispatched::MetadataRejected;
            }
        };
        let Some(first) = update.d.fields.into_iter().next() else {
            warn!("Metadata update without fields ignored.");
            return Dispatched::MetadataRejected;
        };

        let applied = first.field == "metadata";
        if applied {
            let serde_json::Value::Object(meta) = first.value else {
                warn!("Metadata value is not an object, update ignored.");
                return Dispatched::MetadataRejected;
            };
            self.meta = meta;
            self.persist_metadata();
            if let Err(e) = self.publish_metadata().await {
                error!("Failed to republish metadata: {}", e);
            }
        }

        if let Some(handler) = self.metadata_handler.as_mut() {
            handler(topic, payload);
        }
        Dispatched::Metadata { applied }
    }

    fn persist_metadata(&self) {
        let Some(store) = &self.store else {
            return;
        };
        let cfg = PersistedConfig {
            broker: self.identity.broker.clone(),
            device_id: self.identity.device_id.clone(),
            token: self.identity.token.clone(),
            meta: self.meta.clone(),
        };
        if let Err(e) = store.save(&cfg) {
            error!("Failed to persist metadata: {}", e);
        }
    }

    async fn factory_reset(&mut self) {
        let Some(store) = &self.store else {
            return;
        };
        if let Err(e) = store.factory_reset() {
            error!("Error in erasing the config file: {}", e);
            return;
        }
        self.meta = with_default_pub_interval(Metadata::new());
        if let Err(e) = self.publish_metadata().await {
            error!("Failed to republish metadata after reset: {}", e);
        }
    }

    async fn publish_metadata(&mut self) -> Result<(), TransportError> {
        let payload = metadata_payload(&self.meta);
        self.transport
            .publish(&self.topics.meta, payload.as_bytes(), 0, true)
            .await
    }

    /// Reports to the status-log topic; failures there are only logged.
    pub async fn log_status(&mut self, status: &str, message: &str) {
        let payload = status_log_payload(status, message);
        if let Err(e) = self
            .transport
            .publish(&self.topics.log, payload.as_bytes(), 0, false)
            .await
        {
            warn!("Failed to publish status log: {}", e);
        }
    }

    pub async fn publish_event(&mut self, event_id: &str, payload: &[u8]) -> Result<(), TransportError> {
        self.publish_event_with(event_id, payload, &EventOptions::default())
            .await
    }

    pub async fn publish_event_with(
        &mut self,
        event_id: &str,
        payload: &[u8],
        options: &EventOptions,
    ) -> Result<(), TransportError> {
        let topic = self.topics.event(event_id, &options.format);
        self.transport
            .publish(&topic, payload, options.qos, options.retain)
            .await
    }

    /// Graceful stop: announce offline and close the session.
    pub async fn shutdown(&mut self) -> Result<(), TransportError> {
        if self.state != AgentState::Connected {
            return Ok(());
        }
        let offline = presence_payload("offline");
        self.transport
            .publish(&self.topics.connection(), offline.as_bytes(), 0, true)
            .await?;
        self.transport.disconnect().await?;
        self.state = AgentState::Disconnected;
        Ok(())
    }

    fn request_reboot(&mut self) {
        self.reboot_requested = true;
        self.rebooter.reboot();
    }
}
