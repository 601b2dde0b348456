//! Configuration system for Gather.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $GATHER_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/gather/config.toml
//!   3. ~/.config/gather/config.toml

use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use crate::wire::DEFAULT_PORT;

/// Top-level configuration. Shared by the sender daemon and the receiver.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatherConfig {
    pub network: NetworkConfig,
    pub transfer: TransferConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// UDP port senders listen on for REQUEST broadcasts.
    pub discovery_port: u16,
    /// Sender `n` accepts its assignment on TCP `base_port + n`.
    pub base_port: u16,
    /// TCP port the receiver accepts chunks on.
    pub transfer_port: u16,
    /// Destination of the REQUEST broadcast.
    pub broadcast_addr: Ipv4Addr,
    /// Address the receiver puts in ASSIGN. Unset = detect from the routing table.
    pub advertise_addr: Option<Ipv4Addr>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Directory senders serve files from.
    pub input_dir: PathBuf,
    /// Directory the receiver writes assembled files to. Created if absent.
    pub output_dir: PathBuf,
    /// How long the receiver collects ACKs after broadcasting.
    pub discovery_timeout_ms: u64,
    /// Overall limit on chunk reception. 0 = wait forever.
    pub receive_timeout_secs: u64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            discovery_port: DEFAULT_PORT,
            base_port: DEFAULT_PORT,
            transfer_port: DEFAULT_PORT,
            broadcast_addr: Ipv4Addr::BROADCAST,
            advertise_addr: None,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            input_dir: PathBuf::from("input"),
            output_dir: PathBuf::from("output"),
            discovery_timeout_ms: 5_000,
            receive_timeout_secs: 0,
        }
    }
}

impl TransferConfig {
    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms)
    }

    /// `None` when reception may block forever.
    pub fn receive_timeout(&self) -> Option<Duration> {
        (self.receive_timeout_secs > 0).then(|| Duration::from_secs(self.receive_timeout_secs))
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("gather")
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
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl GatherConfig {
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
            GatherConfig::default()
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("GATHER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        Self::write_default_to(&path)?;
        Ok(path)
    }

    /// Write the default config to `path` unless a file is already there.
    /// Returns whether a file was written.
    pub fn write_default_to(path: &std::path::Path) -> Result<bool, ConfigError> {
        if path.exists() {
            return Ok(false);
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))?;
        }
        let text =
            toml::to_string_pretty(&GatherConfig::default()).map_err(ConfigError::SerializeFailed)?;
        std::fs::write(path, text).map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))?;
        Ok(true)
    }

    /// Apply GATHER_* overrides. Unparseable values are ignored.
    fn apply_env_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(p) = var("GATHER_NETWORK__DISCOVERY_PORT").and_then(|v| v.parse().ok()) {
            self.network.discovery_port = p;
        }
        if let Some(p) = var("GATHER_NETWORK__BASE_PORT").and_then(|v| v.parse().ok()) {
            self.network.base_port = p;
        }
        if let Some(p) = var("GATHER_NETWORK__TRANSFER_PORT").and_then(|v| v.parse().ok()) {
            self.network.transfer_port = p;
        }
        if let Some(a) = var("GATHER_NETWORK__BROADCAST_ADDR").and_then(|v| v.parse().ok()) {
            self.network.broadcast_addr = a;
        }
        if let Some(a) = var("GATHER_NETWORK__ADVERTISE_ADDR").and_then(|v| v.parse().ok()) {
            self.network.advertise_addr = Some(a);
        }
        if let Some(v) = var("GATHER_TRANSFER__INPUT_DIR") {
            self.transfer.input_dir = PathBuf::from(v);
        }
        if let Some(v) = var("GATHER_TRANSFER__OUTPUT_DIR") {
            self.transfer.output_dir = PathBuf::from(v);
        }
        if let Some(ms) = var("GATHER_TRANSFER__DISCOVERY_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.transfer.discovery_timeout_ms = ms;
        }
        if let Some(s) = var("GATHER_TRANSFER__RECEIVE_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            self.transfer.receive_timeout_secs = s;
        }
    }
}
