//! Configuration Module
//!
//! Provides TOML-based configuration for the delivery core with support for:
//! - Delivery limits (inflight/queued message and byte budgets)
//! - MQTT feature flags relevant to delivery
//! - Message store settings (node id for message-id generation)
//! - Persistence settings
//! - Metrics endpoint
//! - Environment variable overrides (EMBERMQ_* prefix)

use std::path::Path;
use std::time::Duration;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

pub use metrics::MetricsConfig;

mod metrics;

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").unwrap();
    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .to_string()
}


/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct Config {
    /// Logging configuration
    pub log: LogConfig,
    /// Delivery limits
    pub delivery: DeliveryConfig,
    /// MQTT feature configuration
    pub mqtt: MqttConfig,
    /// Message store configuration
    pub store: StoreConfig,
    /// Persistence configuration
    #[serde(default)]
    pub persistence: PersistenceConfig,
    /// Metrics configuration
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Delivery limits configuration
///
/// A value of 0 means unbounded for every limit in this section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Maximum concurrent QoS 1/2 messages in flight per client, per direction
    #[serde(default = "default_max_inflight_messages")]
    pub max_inflight_messages: u16,
    /// Byte budget for QoS 1/2 payloads in flight per client
    #[serde(default)]
    pub max_inflight_bytes: usize,
    /// Maximum additional messages queued beyond the inflight window
    #[serde(default = "default_max_queued_messages")]
    pub max_queued_messages: usize,
    /// Byte budget for queued payloads beyond the inflight budget
    #[serde(default)]
    pub max_queued_bytes: usize,
    /// Whether QoS 0 messages are queued for offline persistent clients
    #[serde(default)]
    pub queue_qos0_messages: bool,
    /// Whether a client subscribed to overlapping filters receives one copy
    /// per matching subscription (MQTT v3.1.1 clients only)
    #[serde(default)]
    pub allow_duplicate_messages: bool,
    /// Message expiry sweep interval in seconds
    #[serde(default = "default_expiry_check_interval")]
    pub expiry_check_interval: u64,
}

fn default_max_inflight_messages() -> u16 {
    20
}
fn default_max_queued_messages() -> usize {
    1000
}
fn default_expiry_check_interval() -> u64 {
    10
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_inflight_messages: default_max_inflight_messages(),
            max_inflight_bytes: 0,
            max_queued_messages: default_max_queued_messages(),
            max_queued_bytes: 0,
            queue_qos0_messages: false,
            allow_duplicate_messages: false,
            expiry_check_interval: default_expiry_check_interval(),
        }
    }
}

impl DeliveryConfig {
    /// Get expiry sweep interval as Duration
    pub fn expiry_check_interval_duration(&self) -> Duration {
        Duration::from_secs(self.expiry_check_interval)
    }
}

/// MQTT feature configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// Maximum QoS level granted to any delivery (0, 1, or 2)
    #[serde(default = "default_max_qos")]
    pub max_qos: u8,
    /// Whether retained messages are available
    #[serde(default = "default_true")]
    pub retain_available: bool,
}

fn default_max_qos() -> u8 {
    2
}
fn default_true() -> bool {
    true
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            max_qos: default_max_qos(),
            retain_available: true,
        }
    }
}

/// Message store configuration
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct StoreConfig {
    /// Node identifier baked into generated message ids (0..=1023).
    /// Must be unique among brokers sharing a persistence backend.
    pub node_id: u16,
}

/// Persistence configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Whether message persistence is enabled
    pub enabled: bool,
    /// Data directory for the embedded backend
    #[serde(default = "default_persistence_path")]
    pub path: String,
    /// How often the background writer commits a batch
    #[serde(with = "humantime_serde", default = "default_flush_interval")]
    pub flush_interval: Duration,
    /// Maximum operations per committed batch
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
}

fn default_persistence_path() -> String {
    "data".to_string()
}
fn default_flush_interval() -> Duration {
    Duration::from_millis(200)
}
fn default_max_batch_size() -> usize {
    1000
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: default_persistence_path(),
            flush_interval: default_flush_interval(),
            max_batch_size: default_max_batch_size(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// Supports two forms of environment variable usage:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` syntax in the TOML file
    /// 2. Override via env vars: `EMBERMQ__` prefix with double underscores for nesting:
    ///    - `EMBERMQ__DELIVERY__MAX_INFLIGHT_MESSAGES=64` overrides `delivery.max_inflight_messages`
    ///    - `EMBERMQ__STORE__NODE_ID=7` overrides `store.node_id`
    ///    - `EMBERMQ__PERSISTENCE__ENABLED=true` overrides `persistence.enabled`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            // Start with defaults
            .set_default("log.level", "info")?
            .set_default("delivery.max_inflight_messages", 20)?
            .set_default("delivery.max_inflight_bytes", 0)?
            .set_default("delivery.max_queued_messages", 1000)?
            .set_default("delivery.max_queued_bytes", 0)?
            .set_default("delivery.queue_qos0_messages", false)?
            .set_default("delivery.allow_duplicate_messages", false)?
            .set_default("delivery.expiry_check_interval", 10)?
            .set_default("mqtt.max_qos", 2)?
            .set_default("mqtt.retain_available", true)?
            .set_default("store.node_id", 0)?
            .set_default("persistence.enabled", false)?
            .set_default("persistence.path", "data")?
            .set_default("persistence.max_batch_size", 1000)?;

        // Load from file with env var substitution
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content);
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // File doesn't exist, use defaults
            }
            Err(e) => return Err(ConfigError::Io(e)),
        }

        // Override with environment variables (EMBERMQ__DELIVERY__..., etc.)
        // Double underscore separates nested keys, single underscore preserved in field names
        let cfg = builder
            .add_source(
                Environment::with_prefix("EMBERMQ")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with environment variable overrides only (no file).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Path::new(""))
    }

    /// Parse configuration from a string (for testing, no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mqtt.max_qos > 2 {
            return Err(ConfigError::Validation(
                "max_qos must be 0, 1, or 2".to_string(),
            ));
        }

        // Node id occupies the top 10 bits of a message id
        if self.store.node_id > 1023 {
            return Err(ConfigError::Validation(
                "store.node_id must be in 0..=1023".to_string(),
            ));
        }

        if self.persistence.enabled {
            if self.persistence.path.is_empty() {
                return Err(ConfigError::Validation(
                    "persistence.path is required when persistence is enabled".to_string(),
                ));
            }
            if self.persistence.max_batch_size == 0 {
                return Err(ConfigError::Validation(
                    "persistence.max_batch_size must be greater than zero".to_string(),
                ));
            }
        }

        // Note: 0 means unbounded for all delivery limits

        Ok(())
    }
}
