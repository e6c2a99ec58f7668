use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub type Metadata = Map<String, Value>;

/// Reserved metadata key holding the publish cadence in milliseconds.
pub const PUB_INTERVAL_KEY: &str = "pubInterval";
pub const DEFAULT_PUB_INTERVAL_MS: u64 = 5000;

/// Identity of the one device an agent speaks for. Fixed for the agent's lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub device_id: String,
    pub broker: String,
    pub token: Option<String>,
}

/// Durable device record, stored as `{"broker", "devId", "token", "meta"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedConfig {
    pub broker: String,
    #[serde(rename = "devId")]
    pub device_id: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub meta: Metadata,
}

impl PersistedConfig {
    pub fn is_valid(&self) -> bool {
        !self.device_id.is_empty() && !self.broker.is_empty()
    }

    pub fn identity(&self) -> DeviceIdentity {
        DeviceIdentity {
            device_id: self.device_id.clone(),
            broker: self.broker.clone(),
            token: self.token.clone(),
        }
    }
}

/// Fills in `pubInterval` when the record did not carry one.
pub fn with_default_pub_interval(mut meta: Metadata) -> Metadata {
    meta.entry(PUB_INTERVAL_KEY)
        .or_insert_with(|| Value::from(DEFAULT_PUB_INTERVAL_MS));
    meta
}

/// Every management payload is wrapped in a `{"d": ...}` object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub d: T,
}

impl<T: Serialize> Envelope<T> {
    pub fn to_json(&self) -> String {
        // Serializing plain structs and JSON maps cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Presence {
    pub status: String,
}

pub fn presence_payload(status: &str) -> String {
    Envelope {
        d: Presence {
            status: status.to_string(),
        },
    }
    .to_json()
}

#[derive(Debug, Serialize)]
pub struct MetadataSnapshot<'a> {
    pub metadata: &'a Metadata,
}

pub fn metadata_payload(meta: &Metadata) -> String {
    Envelope {
        d: MetadataSnapshot { metadata: meta },
    }
    .to_json()
}

#[derive(Deserialize, Debug, Clone)]
pub struct MetadataUpdate {
    pub fields: Vec<FieldUpdate>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct FieldUpdate {
    pub field: String,
    pub value: Value,
}

#[derive(Deserialize, Debug, Clone)]
pub struct UpgradeRequest {
    pub upgrade: UpgradeTarget,
}

#[derive(Deserialize, Debug, Clone)]
pub struct UpgradeTarget {
    pub fw_url: String,
}

#[derive(Debug, Serialize)]
pub struct StatusLog<'a> {
    pub status: &'a str,
    pub message: &'a str,
}

pub fn status_log_payload(status: &str, message: &str) -> String {
    Envelope {
        d: StatusLog { status, message },
    }
    .to_json()
}
