use dotenvy::dotenv;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::models::DeviceIdentity;
use crate::topics::DEFAULT_PREFIX;

#[derive(Debug, Clone)]
pub struct Settings {
    pub config_path: PathBuf,
    pub app_path: PathBuf,
    pub archive_dir: PathBuf,
    pub topic_prefix: String,

    /// Set when the identity is given explicitly instead of read from `config_path`.
    pub explicit_identity: Option<DeviceIdentity>,

    pub ca_path: Option<PathBuf>,
    pub mqtt_port: u16,
    pub keep_alive: Duration,
    pub poll_timeout: Duration,
    pub connect_timeout: Duration,
    pub download_timeout: Duration,
    pub reboot_exit_code: i32,
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Environment variable {0} is missing or invalid.")]
    MissingOrInvalid(String),
    #[error("Parsing error: {0}")]
    ParsingError(String),
}

const DEFAULT_CA_FILE: &str = "ca.pem";

impl Settings {
    pub fn from_env() -> Result<Self, SettingsError> {
        dotenv().ok(); // Load environment variables from .env file
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, SettingsError> {
        let parse_or = |key: &str, default: u64| -> Result<u64, SettingsError> {
            match lookup(key) {
                Some(raw) => raw
                    .parse::<u64>()
                    .map_err(|_| SettingsError::ParsingError(format!("{} must be a valid number", key))),
                None => Ok(default),
            }
        };

        let explicit_identity = match (lookup("DEVICE_ID"), lookup("DEVICE_BROKER")) {
            (Some(device_id), Some(broker)) => Some(DeviceIdentity {
                device_id,
                broker,
                token: lookup("DEVICE_TOKEN"),
            }),
            (None, None) => None,
            (Some(_), None) => return Err(SettingsError::MissingOrInvalid("DEVICE_BROKER".to_string())),
            (None, Some(_)) => return Err(SettingsError::MissingOrInvalid("DEVICE_ID".to_string())),
        };

        let ca_path = lookup("DEVICE_CA_PATH").map(PathBuf::from).or_else(|| {
            Path::new(DEFAULT_CA_FILE)
                .exists()
                .then(|| PathBuf::from(DEFAULT_CA_FILE))
        });

        let default_port = if ca_path.is_some() { 8883 } else { 1883 };
        let mqtt_port = u16::try_from(parse_or("DEVICE_MQTT_PORT", default_port)?)
            .map_err(|_| SettingsError::ParsingError("DEVICE_MQTT_PORT must be a valid port".to_string()))?;

        // Explicitly configured devices keep a shorter keep-alive.
        let default_keep_alive = if explicit_identity.is_some() { 15 } else { 60 };

        let reboot_exit_code = match lookup("DEVICE_REBOOT_EXIT_CODE") {
            Some(raw) => raw.parse::<i32>().map_err(|_| {
                SettingsError::ParsingError("DEVICE_REBOOT_EXIT_CODE must be an integer".to_string())
            })?,
            None => 3,
        };

        let settings = Self {
            config_path: lookup("DEVICE_CONFIG_PATH")
                .unwrap_or_else(|| "device.cfg".to_string())
                .into(),
            app_path: lookup("DEVICE_APP_PATH")
                .unwrap_or_else(|| "device.bin".to_string())
                .into(),
            archive_dir: lookup("DEVICE_ARCHIVE_DIR")
                .unwrap_or_else(|| "./archive".to_string())
                .into(),
            topic_prefix: lookup("DEVICE_TOPIC_PREFIX").unwrap_or_else(|| DEFAULT_PREFIX.to_string()),
            explicit_identity,
            ca_path,
            mqtt_port,
            keep_alive: Duration::from_secs(parse_or("DEVICE_KEEPALIVE_SECS", default_keep_alive)?),
            poll_timeout: Duration::from_millis(parse_or("DEVICE_POLL_TIMEOUT_MS", 100)?),
            connect_timeout: Duration::from_millis(parse_or("DEVICE_CONNECT_TIMEOUT_MS", 10_000)?),
            download_timeout: Duration::from_secs(parse_or("DEVICE_DOWNLOAD_TIMEOUT_SECS", 60)?),
            reboot_exit_code,
        };

        settings.validate_timeouts()?;

        Ok(settings)
    }

    /// Validate timeout values and other critical configurations.
    fn validate_timeouts(&self) -> Result<(), SettingsError> {
        let in_range = |value: Duration, min_ms: u128, max_ms: u128, key: &str| {
            if (min_ms..=max_ms).contains(&value.as_millis()) {
                Ok(())
            } else {
                Err(SettingsError::ParsingError(format!(
                    "{} must be between {} and {} ms",
                    key, min_ms, max_ms
                )))
            }
        };

        in_range(self.poll_timeout, 10, 10_000, "DEVICE_POLL_TIMEOUT_MS")?;
        in_range(self.connect_timeout, 100, 120_000, "DEVICE_CONNECT_TIMEOUT_MS")?;
        if self.keep_alive < Duration::from_secs(5) {
            return Err(SettingsError::ParsingError(
                "DEVICE_KEEPALIVE_SECS must be at least 5".to_string(),
            ));
        }
        if self.download_timeout.is_zero() {
            return Err(SettingsError::ParsingError(
                "DEVICE_DOWNLOAD_TIMEOUT_SECS must be positive".to_string(),
            ));
        }

        Ok(())
    }
}
