// Configuration: a YAML file under the user's config directory, overridden
// by a handful of environment variables. Values are read once and then
// passed around as immutable value objects.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_CLOUD: &str = "eur.boox.com";

/// Client configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// API host, e.g. `eur.boox.com` or `push.boox.com`.
    pub cloud: String,
    /// Pre-existing bearer token. When set, login is skipped.
    pub token: Option<String>,
    /// Account email used for one-time-code login.
    pub email: Option<String>,
    /// MAC address reported as the uploading device.
    pub device_mac: Option<String>,
    /// Device model reported in the document body.
    pub device_model: String,
    pub distribute_channel: String,
    /// Whether the forged content body carries its own `createdAt`.
    pub include_created_at: bool,
    /// Lifetime of the presigned download URL stored in the document.
    pub signed_url_expiry_secs: i64,
    pub request_timeout_secs: u64,
    /// Number of entries fetched per listing call.
    pub page_size: u32,
    pub upload: UploadConfig,
}

/// Object-storage transfer settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    /// Files at or above this size go through a multipart upload.
    pub multipart_threshold: u64,
    pub part_size: u64,
    /// Where resumable-upload checkpoints are kept.
    pub checkpoint_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cloud: DEFAULT_CLOUD.to_string(),
            token: None,
            email: None,
            device_mac: None,
            device_model: "NoteAir4C".to_string(),
            distribute_channel: "onyx".to_string(),
            include_created_at: false,
            signed_url_expiry_secs: 3600,
            request_timeout_secs: 60,
            page_size: 24,
            upload: UploadConfig::default(),
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        let cache = dirs::cache_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            max_retries: 3,
            retry_delay_ms: 500,
            multipart_threshold: 10 * 1024 * 1024,
            part_size: 1024 * 1024,
            checkpoint_dir: cache.join("send2boox"),
        }
    }
}

impl Config {
    /// Load configuration with priority: env vars > config file > defaults.
    /// A missing file is not an error.
    pub fn load(config_path: Option<PathBuf>) -> Result<Self> {
        let path = config_path.unwrap_or_else(Self::default_config_path);
        let mut config = if path.exists() {
            Self::from_file(&path)?
        } else {
            Self::default()
        };

        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Config = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(cloud) = non_empty("SEND2BOOX_CLOUD") {
            self.cloud = cloud;
        }
        if let Some(token) = non_empty("SEND2BOOX_TOKEN") {
            self.token = Some(token);
        }
        if let Some(email) = non_empty("SEND2BOOX_EMAIL") {
            self.email = Some(email);
        }
        if let Some(mac) = non_empty("SEND2BOOX_DEVICE_MAC") {
            self.device_mac = Some(mac);
        }
    }

    /// Write the configuration back, e.g. after a login obtained a token.
    /// The file holds the bearer token, so on Unix it is kept at mode 0600.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        write_private(path, serde_yaml::to_string(self)?.as_bytes())?;
        Ok(())
    }

    /// Default config file path: ~/.config/send2boox/config.yaml
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("send2boox")
            .join("config.yaml")
    }

    /// The configured token, treating blank strings as absent.
    pub fn token(&self) -> Option<&str> {
        self.token.as_deref().filter(|t| !t.trim().is_empty())
    }

    /// Device MAC, required by the forged document body.
    pub fn device_mac(&self) -> Result<&str> {
        self.device_mac
            .as_deref()
            .filter(|m| !m.trim().is_empty())
            .ok_or_else(|| Error::Configuration("device_mac is not set".into()))
    }
}

#[cfg(unix)]
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    use std::fs::{OpenOptions, Permissions};
    use std::io::Write;
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    // `mode` only applies to newly created files
    file.set_permissions(Permissions::from_mode(0o600))?;
    file.write_all(contents)
}

#[cfg(not(unix))]
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    std::fs::write(path, contents)
}
