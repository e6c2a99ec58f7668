use crate::models::{Metadata, PersistedConfig};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("No configuration record found at {0}.")]
    NotFound(String),
    #[error("Configuration record is invalid: {0}")]
    Invalid(String),
    #[error("Configuration storage I/O failed: {0}")]
    Io(#[from] io::Error),
}

/// Durable home of the device's [`PersistedConfig`].
pub trait ConfigStore: Send + Sync {
    fn load(&self) -> Result<PersistedConfig, StoreError>;

    /// Replaces the whole stored record. Invalid records are rejected before anything is written.
    fn save(&self, cfg: &PersistedConfig) -> Result<(), StoreError>;

    /// Clears the stored metadata while keeping the identity fields.
    fn factory_reset(&self) -> Result<(), StoreError>;
}

/// Parses a record as JSON, then as the single-quoted dict notation provisioning tools emit.
pub fn parse_config(raw: &str) -> Result<PersistedConfig, StoreError> {
    let cfg: PersistedConfig = match serde_json::from_str(raw) {
        Ok(cfg) => cfg,
        Err(strict) => serde_json::from_str(&raw.replace('\'', "\"")).map_err(|_| {
            StoreError::Invalid(strict.to_string())
        })?,
    };
    if !cfg.is_valid() {
        return Err(StoreError::Invalid(
            "both devId and broker must be non-empty".to_string(),
        ));
    }
    Ok(cfg)
}

/// Shell written by a factory reset when no identity survives.
const EMPTY_RECORD: &str = r#"{"meta":{}}"#;

pub struct FileConfigStore {
    path: PathBuf,
}

impl FileConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Saves a record handed over as text, e.g. by the provisioning channel.
    pub fn save_str(&self, raw: &str) -> Result<(), StoreError> {
        let cfg = parse_config(raw)?;
        self.save(&cfg)
    }

    fn write_whole(&self, content: &str) -> Result<(), StoreError> {
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        fs::write(&tmp, content)?;
        if let Err(e) = fs::rename(&tmp, &self.path) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }
}

impl ConfigStore for FileConfigStore {
    fn load(&self) -> Result<PersistedConfig, StoreError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(self.path.display().to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        parse_config(&raw)
    }

    fn save(&self, cfg: &PersistedConfig) -> Result<(), StoreError> {
        if !cfg.is_valid() {
            return Err(StoreError::Invalid(
                "both devId and broker must be non-empty".to_string(),
            ));
        }
        let content =
            serde_json::to_string(cfg).map_err(|e| StoreError::Invalid(e.to_string()))?;
        self.write_whole(&content)?;
        info!("Configuration saved to {}.", self.path.display());
        Ok(())
    }

    fn factory_reset(&self) -> Result<(), StoreError> {
        match self.load() {
            Ok(mut cfg) => {
                cfg.meta = Metadata::new();
                self.save(&cfg)?;
                info!("Factory reset cleared metadata, identity kept.");
            }
            Err(StoreError::Io(e)) => return Err(e.into()),
            Err(e) => {
                warn!("No usable record to keep during factory reset: {}", e);
                self.write_whole(EMPTY_RECORD)?;
            }
        }
        Ok(())
    }
}
