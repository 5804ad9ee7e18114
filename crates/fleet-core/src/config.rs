//! Configuration system for fleet nodes.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $FLEET_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/fleet/config.toml
//!   3. ~/.config/fleet/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default bytes per chunk.
pub const DEFAULT_CHUNK_SIZE: u32 = 1024 * 1024;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    pub network: NetworkConfig,
    pub transfer: TransferSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address the node accepts peer connections on.
    pub listen_addr: String,
    /// Peers to push deployments to when none are given explicitly.
    pub peers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferSettings {
    /// Bytes per chunk for outgoing transfers.
    pub chunk_size: u32,
    /// Where in-flight transfers are spooled.
    pub temp_dir: PathBuf,
    /// Where completed file deployments land.
    pub storage_path: PathBuf,
    /// A session with no chunk for this long is reclaimed.
    pub session_idle_timeout_secs: u64,
    /// How often idle sessions are swept.
    pub sweep_interval_secs: u64,
    /// How long a finished session id is remembered to ignore stragglers.
    pub retired_session_ttl_secs: u64,
    /// Upper bound a caller waits on an outgoing transfer.
    pub transfer_timeout_secs: u64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:4620".to_string(),
            peers: Vec::new(),
        }
    }
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            temp_dir: std::env::temp_dir().join("fleet-transfers"),
            storage_path: data_dir().join("storage"),
            session_idle_timeout_secs: 300,
            sweep_interval_secs: 30,
            retired_session_ttl_secs: 60,
            transfer_timeout_secs: 300,
        }
    }
}

impl TransferSettings {
    pub fn session_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.session_idle_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn retired_session_ttl(&self) -> Duration {
        Duration::from_secs(self.retired_session_ttl_secs)
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer_timeout_secs)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("fleet")
}

pub fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("fleet")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("invalid setting {0}: {1}")]
    Invalid(&'static str, String),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl FleetConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::file_path())
    }

    /// Load from an explicit path, falling back to defaults if it is absent.
    pub fn load_from(path: &std::path::Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(path)
                .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?
        } else {
            FleetConfig::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("FLEET_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&FleetConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.transfer.chunk_size == 0 {
            return Err(ConfigError::Invalid(
                "transfer.chunk_size",
                "must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Apply FLEET_* env var overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("FLEET_NETWORK__LISTEN_ADDR") {
            self.network.listen_addr = v;
        }
        if let Some(v) = lookup("FLEET_TRANSFER__CHUNK_SIZE") {
            if let Ok(size) = v.parse() {
                self.transfer.chunk_size = size;
            }
        }
        if let Some(v) = lookup("FLEET_TRANSFER__STORAGE_PATH") {
            self.transfer.storage_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("FLEET_TRANSFER__SESSION_IDLE_TIMEOUT_SECS") {
            if let Ok(secs) = v.parse() {
                self.transfer.session_idle_timeout_secs = secs;
            }
        }
    }
}
