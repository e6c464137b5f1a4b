//! Configuration management.

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Longest pause the event loop may back off for.
const MAX_EVENT_BACKOFF: Duration = Duration::from_secs(60);

/// Application configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data directory holding node credential material.
    pub data_dir: PathBuf,
    /// Host the daemons' ports are published on.
    pub host: String,
    /// Per-request HTTP timeout in seconds.
    pub request_timeout_secs: u64,
    /// Streaming connection attempts before giving up.
    pub connect_attempts: u32,
    /// Pause after a failed event handler, in milliseconds.
    pub event_backoff_ms: u64,
    /// Default invoice expiry in seconds.
    pub invoice_expiry_secs: u32,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = ProjectDirs::from("", "", "polar")
            .map(|dirs| dirs.data_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from(".polar"));

        Self {
            data_dir,
            host: "127.0.0.1".to_string(),
            request_timeout_secs: 30,
            connect_attempts: 1,
            event_backoff_ms: 500,
            invoice_expiry_secs: 3600,
        }
    }
}

impl Config {
    /// Load configuration from disk or create default.
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            let config = Self::default();
            config.save_to(&config_path)?;
            Ok(config)
        }
    }

    /// Load and validate configuration from a specific file.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to disk.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    /// Save configuration to a specific file.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject values the services cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(Error::Configuration("host must not be empty".into()));
        }
        if self.request_timeout_secs == 0 {
            return Err(Error::Configuration(
                "request_timeout_secs must be at least 1".into(),
            ));
        }
        if self.connect_attempts == 0 {
            return Err(Error::Configuration(
                "connect_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// HTTP request timeout.
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Event loop backoff, capped at one minute.
    #[must_use]
    pub fn event_backoff(&self) -> Duration {
        Duration::from_millis(self.event_backoff_ms).min(MAX_EVENT_BACKOFF)
    }

    /// Get configuration file path.
    fn config_path() -> Result<PathBuf> {
        ProjectDirs::from("", "", "polar")
            .map(|dirs| dirs.config_dir().join("config.json"))
            .ok_or_else(|| Error::Configuration("could not determine config directory".into()))
    }
}
