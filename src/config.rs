//! # Configuration Management
//!
//! Centralized configuration for the mesh relay engine.
//!
//! This module provides structured configuration for the packet codec, the
//! packet store, the relay scheduler, verification and logging.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()`
//! - Direct instantiation with defaults
//! - Environment-specific overrides via `from_env()`
//!
//! ## Radio Considerations
//! - The legacy wire profile fits a 31-byte advertising payload
//! - Tick jitter should stay below the tick interval so transmissions never pile up

use crate::core::codec::WireProfile;
use crate::error::{MeshError, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::Level;

/// Packets older than this are never stored or relayed (12 hours)
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(12 * 60 * 60);

/// Archived records and seen entries are deleted after this (30 days)
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Interval of the expiry sweep (30 minutes)
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// Relay queue ceiling before congestion drops start
pub const DEFAULT_QUEUE_CEILING: usize = 100;

/// Distinct confirming neighbors before an alert counts as verified
pub const DEFAULT_VERIFICATION_THRESHOLD: usize = 3;

/// Main configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct MeshConfig {
    /// Wire codec configuration
    #[serde(default)]
    pub codec: CodecConfig,

    /// Packet store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Relay scheduler configuration
    #[serde(default)]
    pub relay: RelayConfig,

    /// Alert verification configuration
    #[serde(default)]
    pub verification: VerificationConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl MeshConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| MeshError::ConfigError(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| MeshError::ConfigError(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| MeshError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("SOS_MESH_STORE_PATH") {
            config.store.path = if path.is_empty() {
                None
            } else {
                Some(PathBuf::from(path))
            };
        }

        if let Ok(profile) = std::env::var("SOS_MESH_WIRE_PROFILE") {
            config.codec.profile = match profile.to_ascii_lowercase().as_str() {
                "legacy" => WireProfile::Legacy,
                "extended" => WireProfile::Extended,
                other => {
                    return Err(MeshError::ConfigError(format!(
                        "Unknown wire profile: {other}"
                    )))
                }
            };
        }

        if let Ok(max_age) = std::env::var("SOS_MESH_MAX_AGE_SECS") {
            if let Ok(val) = max_age.parse::<u64>() {
                config.store.max_age = Duration::from_secs(val);
            }
        }

        if let Ok(tick) = std::env::var("SOS_MESH_TICK_INTERVAL_MS") {
            if let Ok(val) = tick.parse::<u64>() {
                config.relay.tick_interval = Duration::from_millis(val);
            }
        }

        if let Ok(ceiling) = std::env::var("SOS_MESH_QUEUE_CEILING") {
            if let Ok(val) = ceiling.parse::<usize>() {
                config.relay.queue_ceiling = val;
            }
        }

        if let Ok(threshold) = std::env::var("SOS_MESH_VERIFICATION_THRESHOLD") {
            if let Ok(val) = threshold.parse::<usize>() {
                config.verification.threshold = val;
            }
        }

        Ok(config)
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Generate example configuration file content
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    /// Save configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| MeshError::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| MeshError::ConfigError(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        errors.extend(self.store.validate());
        errors.extend(self.relay.validate());
        errors.extend(self.verification.validate());
        errors.extend(self.logging.validate());

        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(MeshError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

/// Wire codec configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CodecConfig {
    /// Preferred profile for outgoing frames
    pub profile: WireProfile,
}

/// Packet store configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StoreConfig {
    /// Snapshot file; `None` keeps the store in memory only
    pub path: Option<PathBuf>,

    /// Freshness window for packets
    #[serde(with = "duration_serde")]
    pub max_age: Duration,

    /// Hard-delete horizon for archived records and seen entries
    #[serde(with = "duration_serde")]
    pub retention: Duration,

    /// Interval of the expiry sweep
    #[serde(with = "duration_serde")]
    pub sweep_interval: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: None,
            max_age: DEFAULT_MAX_AGE,
            retention: DEFAULT_RETENTION,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

impl StoreConfig {
    /// In-memory store with default windows
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Persisted store at `path` with default windows
    pub fn at_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: Some(path.into()),
            ..Self::default()
        }
    }

    /// Validate store configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.max_age.as_secs() < 60 {
            errors.push("Max age too short (minimum: 60s)".to_string());
        }

        if self.retention < self.max_age {
            errors.push("Retention cannot be shorter than max age".to_string());
        }

        if self.sweep_interval.as_secs() < 1 {
            errors.push("Sweep interval too short (minimum: 1s)".to_string());
        } else if self.sweep_interval > self.max_age {
            errors.push("Sweep interval cannot be longer than max age".to_string());
        }

        if let Some(ref path) = self.path {
            if path.as_os_str().is_empty() {
                errors.push("Store path cannot be empty".to_string());
            }
        }

        errors
    }
}

/// Relay scheduler configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RelayConfig {
    /// Period of the broadcast tick
    #[serde(with = "duration_serde")]
    pub tick_interval: Duration,

    /// Upper bound of the random delay before each transmission
    #[serde(with = "duration_serde")]
    pub jitter_max: Duration,

    /// Maximum number of relay candidates
    pub queue_ceiling: usize,

    /// How many times the terminal Safe packet is sent when broadcasting stops
    pub safe_burst_count: u32,

    /// Spacing of the Safe burst
    #[serde(with = "duration_serde")]
    pub safe_burst_interval: Duration,

    /// Capacity of the coordinator's inbound command channel
    pub command_buffer: usize,

    /// Capacity of each event channel
    pub event_buffer: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(1200),
            jitter_max: Duration::from_millis(500),
            queue_ceiling: DEFAULT_QUEUE_CEILING,
            safe_burst_count: 3,
            safe_burst_interval: Duration::from_millis(250),
            command_buffer: 256,
            event_buffer: 128,
        }
    }
}

impl RelayConfig {
    /// Validate relay configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.tick_interval.as_millis() < 50 {
            errors.push("Tick interval too short (minimum: 50ms)".to_string());
        } else if self.tick_interval.as_secs() > 60 {
            errors.push("Tick interval too long (maximum: 60s)".to_string());
        }

        if self.jitter_max >= self.tick_interval {
            errors.push("Jitter must be shorter than the tick interval".to_string());
        }

        if self.queue_ceiling == 0 {
            errors.push("Queue ceiling must be greater than 0".to_string());
        } else if self.queue_ceiling > 10_000 {
            errors.push(format!(
                "Queue ceiling too large: {} (maximum recommended: 10,000)",
                self.queue_ceiling
            ));
        }

        if self.safe_burst_count == 0 {
            errors.push("Safe burst count must be greater than 0".to_string());
        } else if self.safe_burst_count > 20 {
            errors.push("Safe burst count too large (maximum: 20)".to_string());
        }

        if self.safe_burst_interval.as_secs() > 5 {
            errors.push("Safe burst interval too long (maximum: 5s)".to_string());
        }

        if self.command_buffer == 0 {
            errors.push("Command buffer must be greater than 0".to_string());
        }

        if self.event_buffer == 0 {
            errors.push("Event buffer must be greater than 0".to_string());
        }

        errors
    }
}

/// Alert verification configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VerificationConfig {
    /// Distinct confirming neighbors needed
    pub threshold: usize,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_VERIFICATION_THRESHOLD,
        }
    }
}

impl VerificationConfig {
    /// Validate verification configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.threshold == 0 {
            errors.push("Verification threshold must be greater than 0".to_string());
        } else if self.threshold > 64 {
            errors.push(format!(
                "Verification threshold too large: {} (maximum: 64)",
                self.threshold
            ));
        }

        errors
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    /// Log level
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to log to console
    pub log_to_console: bool,

    /// Whether to log to file
    pub log_to_file: bool,

    /// Path to log file (if log_to_file is true)
    pub log_file_path: Option<String>,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("sos-mesh"),
            log_level: Level::INFO,
            log_to_console: true,
            log_to_file: false,
            log_file_path: None,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    /// Validate logging configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_name.is_empty() {
            errors.push("Application name cannot be empty".to_string());
        } else if self.app_name.len() > 64 {
            errors.push(format!(
                "Application name too long: {} characters (maximum: 64)",
                self.app_name.len()
            ));
        }

        if self.log_to_file {
            if let Some(ref path) = self.log_file_path {
                if let Some(parent) = Path::new(path).parent() {
                    if !parent.as_os_str().is_empty() && !parent.exists() {
                        errors.push(format!(
                            "Log file directory does not exist: {}",
                            parent.display()
                        ));
                    }
                }
            } else {
                errors.push("log_file_path must be specified when log_to_file is true".to_string());
            }
        }

        if !self.log_to_console && !self.log_to_file {
            errors
                .push("At least one logging output (console or file) must be enabled".to_string());
        }

        errors
    }
}

/// Helper module for Duration serialization/deserialization
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis() as u64;
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Helper module for tracing::Level serialization/deserialization
mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let level_str = match *level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        };
        level_str.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level_str = String::deserialize(deserializer)?;
        Level::from_str(&level_str)
            .map_err(|_| serde::de::Error::custom(format!("Invalid log level: {level_str}")))
    }
}
