//! Configuration loading for phonelink.
//!
//! Configuration is loaded from a TOML file (default: `phonelink.toml`).
//! Every section and every field is optional.

use link_core::{CallTrackerConfig, RetryPolicy};
use link_types::ErrorKind;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// This device.
    #[serde(default)]
    pub device: DeviceConfig,
    /// Message sync.
    #[serde(default)]
    pub sync: SyncSettings,
    /// Call state.
    #[serde(default)]
    pub calls: CallsConfig,
    /// Pairing.
    #[serde(default)]
    pub pairing: PairingConfig,
    /// Logging.
    #[serde(default)]
    pub log: LogConfig,
}

/// Device configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Human-readable name shown to paired devices.
    #[serde(default = "default_device_name")]
    pub name: String,
    /// The phone's own numbers (one per SIM).
    #[serde(default)]
    pub own_numbers: Vec<String>,
}

/// Message sync configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Encrypt message bodies (default: true).
    #[serde(default = "default_true")]
    pub e2ee_enabled: bool,
    /// Messages per bulk write (default: 50).
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Pause between bulk writes in milliseconds (default: 200).
    #[serde(default = "default_batch_delay_ms")]
    pub batch_delay_ms: u64,
    /// Largest attachment stored inline when upload fails (default: 50KB).
    #[serde(default = "default_inline_attachment_limit")]
    pub inline_attachment_limit: usize,
    /// Attempts per message write (default: 3).
    #[serde(default = "default_max_write_attempts")]
    pub max_write_attempts: u32,
}

/// Call state configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallsConfig {
    /// Records older than this are removed (default: 60).
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
    /// Commands older than this are ignored (default: 10).
    #[serde(default = "default_command_freshness_secs")]
    pub command_freshness_secs: u64,
    /// Ringing records for the same number are reused within this window (default: 30).
    #[serde(default = "default_ringing_dedup_window_secs")]
    pub ringing_dedup_window_secs: u64,
    /// Sweep interval (default: 15).
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Stop listening for commands after this long without a call (default: 120).
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Upper bound for a single sweep (default: 5).
    #[serde(default = "default_sweep_timeout_secs")]
    pub sweep_timeout_secs: u64,
}

/// Pairing configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairingConfig {
    /// How long a scanned QR code stays valid (default: 300).
    #[serde(default = "default_session_window_secs")]
    pub session_window_secs: u64,
    /// Upper bound for pushing a key bundle (default: 10).
    #[serde(default = "default_key_push_timeout_secs")]
    pub key_push_timeout_secs: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Default filter, overridden by `RUST_LOG` (default: "info").
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default value functions
fn default_device_name() -> String {
    "phonelink phone".to_string()
}

fn default_true() -> bool {
    true
}

fn default_batch_size() -> usize {
    link_core::DEFAULT_BATCH_SIZE
}

fn default_batch_delay_ms() -> u64 {
    200
}

fn default_inline_attachment_limit() -> usize {
    50 * 1024 // 50KB
}

fn default_max_write_attempts() -> u32 {
    3
}

fn default_stale_after_secs() -> u64 {
    60
}

fn default_command_freshness_secs() -> u64 {
    10
}

fn default_ringing_dedup_window_secs() -> u64 {
    30
}

fn default_sweep_interval_secs() -> u64 {
    15
}

fn default_idle_timeout_secs() -> u64 {
    120
}

fn default_sweep_timeout_secs() -> u64 {
    5
}

fn default_session_window_secs() -> u64 {
    300 // 5 minutes
}

fn default_key_push_timeout_secs() -> u64 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: default_device_name(),
            own_numbers: Vec::new(),
        }
    }
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            e2ee_enabled: default_true(),
            batch_size: default_batch_size(),
            batch_delay_ms: default_batch_delay_ms(),
            inline_attachment_limit: default_inline_attachment_limit(),
            max_write_attempts: default_max_write_attempts(),
        }
    }
}

impl Default for CallsConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: default_stale_after_secs(),
            command_freshness_secs: default_command_freshness_secs(),
            ringing_dedup_window_secs: default_ringing_dedup_window_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            sweep_timeout_secs: default_sweep_timeout_secs(),
        }
    }
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            session_window_secs: default_session_window_secs(),
            key_push_timeout_secs: default_key_push_timeout_secs(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl SyncSettings {
    /// Pause between bulk writes.
    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }

    /// Retry policy for single message writes.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_write_attempts.max(1),
            ..RetryPolicy::default()
        }
    }
}

impl CallsConfig {
    /// Tuning for the pure call tracker.
    pub fn tracker_config(&self) -> CallTrackerConfig {
        CallTrackerConfig {
            stale_after: Duration::from_secs(self.stale_after_secs),
            command_freshness: Duration::from_secs(self.command_freshness_secs),
            ringing_dedup_window: Duration::from_secs(self.ringing_dedup_window_secs),
            ..CallTrackerConfig::default()
        }
    }

    /// Sweep interval.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    /// Idle timeout of the command listener.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Upper bound for one sweep.
    pub fn sweep_timeout(&self) -> Duration {
        Duration::from_secs(self.sweep_timeout_secs.max(1))
    }
}

impl PairingConfig {
    /// Session window.
    pub fn session_window(&self) -> Duration {
        Duration::from_secs(self.session_window_secs)
    }

    /// Upper bound for pushing a key bundle.
    pub fn key_push_timeout(&self) -> Duration {
        Duration::from_secs(self.key_push_timeout_secs.max(1))
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Render as TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Encode)
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
    /// Failed to render configuration.
    #[error("failed to encode config: {0}")]
    Encode(#[source] toml::ser::Error),
}

impl ConfigError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConfigError::ReadError { .. } => ErrorKind::Transient,
            ConfigError::ParseError { .. } | ConfigError::Encode(_) => ErrorKind::Protocol,
        }
    }
}
