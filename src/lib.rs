pub mod agent;
pub mod config;
pub mod firmware;
pub mod models;
pub mod mqtt_service;
pub mod service_utils;
pub mod store;
pub mod topics;

pub use agent::{AgentBuilder, AgentError, AgentState, DeviceAgent, Dispatched, IdentitySource};
pub use firmware::{FirmwareUpdater, UpdateError, UpdateOutcome};
pub use store::{ConfigStore, FileConfigStore, StoreError};
pub use topics::TopicSet;
