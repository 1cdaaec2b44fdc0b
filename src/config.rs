//! Configuration loading from TOML.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs.
//! Every field has a default so a partial (or missing) file still yields
//! a usable configuration.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::info;

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

/// Who may call `refundTimeout` once the activation window has elapsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefundAccess {
    /// Any caller may trigger the overdue refund.
    #[default]
    Permissionless,
    /// Only the seller or the buyer of the trade.
    Participants,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EngineConfig {
    /// Seconds after activation before the trade may be refunded.
    #[serde(default = "default_activation_window_secs")]
    pub activation_window_secs: u64,
    #[serde(default)]
    pub refund_access: RefundAccess,
    /// Buffer size of the event subscription channel.
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            activation_window_secs: default_activation_window_secs(),
            refund_access: RefundAccess::default(),
            event_channel_capacity: default_event_channel_capacity(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_snapshot_path")]
    pub snapshot_path: String,
    #[serde(default = "default_snapshot_interval_secs")]
    pub snapshot_interval_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            snapshot_path: default_snapshot_path(),
            snapshot_interval_secs: default_snapshot_interval_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ApiConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_port(),
        }
    }
}

fn default_activation_window_secs() -> u64 {
    300
}

fn default_event_channel_capacity() -> usize {
    256
}

fn default_snapshot_path() -> String {
    "dualstake_state.json".to_string()
}

fn default_snapshot_interval_secs() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_port() -> u16 {
    8080
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        let config = Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {path}"))?;
        Ok(config)
    }

    /// Load from `path`, or fall back to defaults if the file is absent.
    pub fn load_or_default(path: &str) -> Result<Self> {
        if !Path::new(path).exists() {
            info!(path, "No config file found, using defaults");
            return Ok(Self::default());
        }
        Self::load(path)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.engine.activation_window_secs == 0 {
            bail!("engine.activation_window_secs must be greater than zero");
        }
        if self.engine.event_channel_capacity == 0 {
            bail!("engine.event_channel_capacity must be greater than zero");
        }
        if self.storage.snapshot_interval_secs == 0 {
            bail!("storage.snapshot_interval_secs must be greater than zero");
        }
        Ok(())
    }
}
