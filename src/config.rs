//! Configuration loading and persistence.
//!
//! Reads `config.json` from the acomm config directory and applies
//! `ACOMM_*` environment overrides on top.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::constants::{DEFAULT_REQUEST_TIMEOUT, HTTP_REQUEST_TIMEOUT};
use crate::error::AcommError;

/// Name of the config file inside [`Config::config_dir`].
pub const CONFIG_FILE: &str = "config.json";

/// Runtime configuration for trackers, task servers and the CLI.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Directory holding tracker, server and stream sockets.
    pub socket_dir: PathBuf,
    /// Timeout in seconds for requests issued by the CLI. 0 waits forever.
    pub default_timeout_secs: u64,
    /// Timeout in seconds for HTTP sends and relays.
    pub http_timeout_secs: u64,
    /// Seconds a published stream waits for its consumer. Unset waits forever.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_connect_timeout_secs: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        let socket_dir = dirs::runtime_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("acomm");

        Self {
            socket_dir,
            default_timeout_secs: DEFAULT_REQUEST_TIMEOUT.as_secs(),
            http_timeout_secs: HTTP_REQUEST_TIMEOUT.as_secs(),
            stream_connect_timeout_secs: None,
        }
    }
}

impl Config {
    /// Returns the configuration directory path.
    ///
    /// `ACOMM_CONFIG_DIR` wins; otherwise the platform config dir
    /// (e.g. `~/.config/acomm`).
    pub fn config_dir() -> Result<PathBuf> {
        if let Ok(dir) = std::env::var("ACOMM_CONFIG_DIR") {
            return Ok(PathBuf::from(dir));
        }
        Ok(dirs::config_dir()
            .context("Could not determine config directory")?
            .join("acomm"))
    }

    /// Loads configuration from the config directory, with environment
    /// variable overrides. A missing file means defaults.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::config_dir()?)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Loads `config.json` from `dir` without environment overrides.
    pub fn load_from(dir: &Path) -> Result<Self> {
        let config_path = dir.join(CONFIG_FILE);
        if !config_path.exists() {
            log::debug!("[Config] {} not found, using defaults", config_path.display());
            return Ok(Self::default());
        }
        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", config_path.display()))
    }

    /// Apply `ACOMM_*` overrides. Unparseable numbers are ignored with a
    /// warning.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup("ACOMM_SOCKET_DIR") {
            self.socket_dir = PathBuf::from(dir);
        }

        let secs = |key: &str| -> Option<u64> {
            let raw = lookup(key)?;
            match raw.parse::<u64>() {
                Ok(v) => Some(v),
                Err(_) => {
                    log::warn!("[Config] Ignoring {key}={raw}: not a number of seconds");
                    None
                }
            }
        };

        if let Some(v) = secs("ACOMM_DEFAULT_TIMEOUT") {
            self.default_timeout_secs = v;
        }
        if let Some(v) = secs("ACOMM_HTTP_TIMEOUT") {
            self.http_timeout_secs = v;
        }
        if let Some(v) = secs("ACOMM_STREAM_CONNECT_TIMEOUT") {
            self.stream_connect_timeout_secs = (v > 0).then_some(v);
        }
    }

    /// Reject values the runtime cannot work with.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.http_timeout_secs == 0 {
            return Err(AcommError::Config("http_timeout_secs must be positive".into()));
        }
        if self.socket_dir.as_os_str().is_empty() {
            return Err(AcommError::Config("socket_dir must not be empty".into()));
        }
        Ok(())
    }

    /// Persists the configuration to `dir`, owner read/write only.
    pub fn save_to(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)?;
        let config_path = dir.join(CONFIG_FILE);
        fs::write(&config_path, serde_json::to_string_pretty(self)?)?;

        #[cfg(unix)]
        fs::set_permissions(&config_path, fs::Permissions::from_mode(0o600))?;

        Ok(())
    }

    /// Request timeout for CLI-issued requests.
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    /// HTTP client timeout.
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    /// Consumer-connect timeout for published streams.
    pub fn stream_connect_timeout(&self) -> Option<Duration> {
        self.stream_connect_timeout_secs.map(Duration::from_secs)
    }

    /// Directory for stream sockets.
    pub fn stream_dir(&self) -> PathBuf {
        self.socket_dir.join("streams")
    }

    /// Socket path of the task server named `name`.
    pub fn server_socket(&self, name: &str) -> PathBuf {
        self.socket_dir.join(format!("{name}.sock"))
    }
}
