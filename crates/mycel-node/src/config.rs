//! Configuration system for Mycel nodes.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $MYCEL_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/mycel/config.toml
//!   3. ~/.config/mycel/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MycelConfig {
    pub identity: IdentityConfig,
    pub worker: WorkerConfig,
    pub gossip: GossipConfig,
    pub tree: TreeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Unique device id (hex). Empty = derive one from the hostname; real
    /// devices pass their hardware id at boot instead.
    pub device_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Pause between scheduler ticks, milliseconds.
    pub interval_ms: u64,
    /// Enable the modem-sleep power cycle.
    pub use_modem_sleep: bool,
    /// Light-sleep window, milliseconds.
    pub modem_sleep_ms: u64,
    /// Minimum awake window, milliseconds.
    pub modem_wake_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GossipConfig {
    pub enabled: bool,
    /// Delay before the first anti-entropy sweep, seconds.
    pub start_delay_s: u64,
    /// Per-peer id sweep cadence, seconds.
    pub sync_interval_s: u64,
    /// Echo repeat delay, milliseconds.
    pub echo_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TreeConfig {
    pub enabled: bool,
    /// Start jitter ceiling, milliseconds.
    pub max_start_delay_ms: u64,
    /// Maintenance cadence, milliseconds.
    pub maintenance_delay_ms: u64,
    /// Claim/parent staleness bound, seconds.
    pub max_tree_age_s: u64,
    /// SEND repeats per maintenance round.
    pub broadcast_count: u8,
    /// Publish the local address over gossip.
    pub publish: bool,
    /// Subscribe to the tree topic for remote routes.
    pub subscribe: bool,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for IdentityConfig {
    fn default() -> Self {
        Self { device_id: String::new() }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1,
            use_modem_sleep: false,
            modem_sleep_ms: crate::MODEM_SLEEP_MS,
            modem_wake_ms: crate::MODEM_WAKE_MS,
        }
    }
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self { enabled: true, start_delay_s: 10, sync_interval_s: 20, echo_delay_ms: 20 }
    }
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_start_delay_ms: 10_000,
            maintenance_delay_ms: 20_000,
            max_tree_age_s: 60,
            broadcast_count: 1,
            publish: true,
            subscribe: false,
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_or_tmp().join(".config"))
        .join("mycel")
}

fn home_or_tmp() -> PathBuf {
    std::env::var("HOME").map(PathBuf::from).unwrap_or_else(|_| PathBuf::from("/tmp"))
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

impl MycelConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            MycelConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("MYCEL_CONFIG")
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
            let text = toml::to_string_pretty(&MycelConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply MYCEL_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("MYCEL_IDENTITY__DEVICE_ID") {
            self.identity.device_id = v;
        }
        if let Ok(v) = std::env::var("MYCEL_WORKER__INTERVAL_MS") {
            if let Ok(ms) = v.parse() {
                self.worker.interval_ms = ms;
            }
        }
        if let Ok(v) = std::env::var("MYCEL_WORKER__USE_MODEM_SLEEP") {
            self.worker.use_modem_sleep = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("MYCEL_GOSSIP__ENABLED") {
            self.gossip.enabled = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("MYCEL_TREE__ENABLED") {
            self.tree.enabled = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("MYCEL_TREE__SUBSCRIBE") {
            self.tree.subscribe = v == "true" || v == "1";
        }
    }

    /// The device id bytes: configured hex, or a hostname-derived fallback
    /// for development hosts without a hardware id.
    pub fn device_id_bytes(&self) -> Vec<u8> {
        if !self.identity.device_id.is_empty() {
            if let Ok(bytes) = hex::decode(&self.identity.device_id) {
                return bytes;
            }
        }
        std::env::var("HOSTNAME")
            .unwrap_or_else(|_| "mycel-dev-node".to_string())
            .into_bytes()
    }
}

impl From<&GossipConfig> for crate::gossip::GossipParams {
    fn from(c: &GossipConfig) -> Self {
        crate::gossip::GossipParams {
            start_delay_s: c.start_delay_s,
            sync_interval_s: c.sync_interval_s,
            echo_delay_ms: c.echo_delay_ms,
        }
    }
}

impl From<&TreeConfig> for crate::tree::TreeParams {
    fn from(c: &TreeConfig) -> Self {
        crate::tree::TreeParams {
            max_start_delay_ms: c.max_start_delay_ms,
            maintenance_delay_ms: c.maintenance_delay_ms,
            max_tree_age_s: c.max_tree_age_s,
            broadcast_count: c.broadcast_count,
            broadcast_interval_ms: crate::MODEM_INTERSECT_INTERVAL_MS,
            publish: c.publish,
            subscribe: c.subscribe,
        }
    }
}
