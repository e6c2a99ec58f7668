use async_trait::async_trait;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::models::{Envelope, UpgradeRequest};
use crate::service_utils::Rebooter;

const ALLOWED_SCHEMES: [&str; 2] = ["http://", "https://"];

/// Archive copies move through memory in pieces of this size.
const COPY_CHUNK: usize = 512;

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("Upgrade message is not valid: {0}")]
    Parse(String),
    #[error("Invalid URL for upgrade: '{0}'")]
    InvalidUrl(String),
    #[error("Archiving the running image failed: {0}")]
    Archive(io::Error),
    #[error("Firmware download failed: {0}")]
    Download(String),
    #[error("Download failed with status {0}")]
    HttpStatus(u16),
    #[error("Installing the new image failed: {0}")]
    Install(io::Error),
}

#[derive(Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

/// Fetches firmware images.
#[async_trait]
pub trait HttpFetcher: Send + Sync {
    async fn get(&self, url: &str) -> Result<HttpResponse, UpdateError>;
}

pub struct ReqwestFetcher {
    client: reqwest::Client,
}

impl ReqwestFetcher {
    pub fn new(request_timeout: Duration) -> Result<Self, UpdateError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| UpdateError::Download(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpFetcher for ReqwestFetcher {
    async fn get(&self, url: &str) -> Result<HttpResponse, UpdateError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| UpdateError::Download(e.to_string()))?;
        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|e| UpdateError::Download(e.to_string()))?;
        Ok(HttpResponse {
            status,
            body: body.to_vec(),
        })
    }
}

/// Accepts only http(s) URLs whose host is `localhost` or contains a dot.
pub fn validate_update_url(url: &str) -> Result<(), UpdateError> {
    let invalid = || UpdateError::InvalidUrl(url.to_string());

    let rest = ALLOWED_SCHEMES
        .iter()
        .find_map(|scheme| url.strip_prefix(scheme))
        .ok_or_else(invalid)?;
    if rest.is_empty() || rest.starts_with('/') {
        return Err(invalid());
    }

    let authority = rest.split('/').next().unwrap_or_default();
    let host = authority.split(':').next().unwrap_or_default();
    if host != "localhost" && !host.contains('.') {
        return Err(invalid());
    }
    Ok(())
}

/// One past the highest `<app_file_name>.<N>` in `archive_dir`, or 0 when there is none.
pub fn next_archive_slot(archive_dir: &Path, app_file_name: &str) -> io::Result<u64> {
    let prefix = format!("{}.", app_file_name);
    let mut highest: Option<u64> = None;

    for entry in fs::read_dir(archive_dir)? {
        let name = entry?.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        let Some(suffix) = name.strip_prefix(&prefix) else {
            continue;
        };
        if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
            continue;
        }
        if let Ok(slot) = suffix.parse::<u64>() {
            highest = Some(highest.map_or(slot, |h| h.max(slot)));
        }
    }

    match highest {
        None => Ok(0),
        Some(h) => h.checked_add(1).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::Other,
                format!("archive slots for {} are exhausted", app_file_name),
            )
        }),
    }
}

fn copy_chunked(src: &Path, dst: &Path) -> io::Result<u64> {
    let mut reader = File::open(src)?;
    let mut writer = File::create(dst)?;
    let mut buf = [0u8; COPY_CHUNK];
    let mut copied = 0u64;

    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n])?;
        copied += n as u64;
    }
    writer.sync_all()?;
    Ok(copied)
}

/// Where a finished pipeline left the device.
#[derive(Debug)]
pub enum UpdateOutcome {
    /// New image installed and reboot requested.
    Installed { archived: PathBuf },
    /// Pipeline aborted; the running image is untouched unless the error is `Install`.
    Aborted(UpdateError),
}

impl UpdateOutcome {
    pub fn is_installed(&self) -> bool {
        matches!(self, UpdateOutcome::Installed { .. })
    }
}

pub struct FirmwareUpdater {
    app_path: PathBuf,
    archive_dir: PathBuf,
    fetcher: Box<dyn HttpFetcher>,
    rebooter: Arc<dyn Rebooter>,
}

impl FirmwareUpdater {
    pub fn new(
        app_path: impl Into<PathBuf>,
        archive_dir: impl Into<PathBuf>,
        fetcher: Box<dyn HttpFetcher>,
        rebooter: Arc<dyn Rebooter>,
    ) -> Self {
        Self {
            app_path: app_path.into(),
            archive_dir: archive_dir.into(),
            fetcher,
            rebooter,
        }
    }

    pub fn app_path(&self) -> &Path {
        &self.app_path
    }

    /// Runs the whole pipeline for one upgrade message.
    pub async fn handle(&self, payload: &[u8]) -> UpdateOutcome {
        match self.run(payload).await {
            Ok(archived) => {
                info!("Firmware installed, rebooting into the new image.");
                self.rebooter.reboot();
                UpdateOutcome::Installed { archived }
            }
            Err(e) => {
                error!("{}", e);
                UpdateOutcome::Aborted(e)
            }
        }
    }

    async fn run(&self, payload: &[u8]) -> Result<PathBuf, UpdateError> {
        let request: Envelope<UpgradeRequest> =
            serde_json::from_slice(payload).map_err(|e| UpdateError::Parse(e.to_string()))?;
        let url = request.d.upgrade.fw_url;
        validate_update_url(&url)?;

        let archived = self.archive().map_err(UpdateError::Archive)?;
        info!("Running image archived to {}.", archived.display());

        let response = self.fetcher.get(&url).await?;
        if response.status != 200 {
            return Err(UpdateError::HttpStatus(response.status));
        }
        info!("Firmware download completed ({} bytes).", response.body.len());

        self.install(&response.body).map_err(UpdateError::Install)?;
        Ok(archived)
    }

    fn app_file_name(&self) -> io::Result<String> {
        self.app_path
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("no file name in {}", self.app_path.display()),
                )
            })
    }

    fn archive(&self) -> io::Result<PathBuf> {
        fs::create_dir_all(&self.archive_dir)?;
        let name = self.app_file_name()?;
        let slot = next_archive_slot(&self.archive_dir, &name)?;
        let target = self.archive_dir.join(format!("{}.{}", name, slot));

        if let Err(e) = copy_chunked(&self.app_path, &target) {
            let _ = fs::remove_file(&target);
            return Err(e);
        }
        Ok(target)
    }

    /// Writes beside the image and renames over it; falls back to an in-place write.
    fn install(&self, image: &[u8]) -> io::Result<()> {
        let mut staged = self.app_path.clone().into_os_string();
        staged.push(".download");
        let staged = PathBuf::from(staged);

        let staged_write = File::create(&staged).and_then(|mut f| {
            f.write_all(image)?;
            f.sync_all()
        });
        if let Err(e) = staged_write {
            let _ = fs::remove_file(&staged);
            return Err(e);
        }

        if let Err(e) = fs::rename(&staged, &self.app_path) {
            warn!(
                "Atomic rename unavailable ({}), overwriting {} in place.",
                e,
                self.app_path.display()
            );
            let _ = fs::remove_file(&staged);
            let mut f = File::create(&self.app_path)?;
            f.write_all(image)?;
            f.sync_all()?;
        }
        Ok(())
    }
}
