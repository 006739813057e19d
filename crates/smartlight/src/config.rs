//! Configuration file parsing and structures.
//!
//! smartlight reads a single TOML file. Every section is optional; anything left out
//! falls back to the values the controller ships with (public HiveMQ broker, device
//! `light1`, 500 ms brightness debounce).

use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use tracing_subscriber::filter::LevelFilter;

/// Top-level configuration structure
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub broker: BrokerConfig,
    pub device: DeviceConfig,
    pub session: SessionConfig,
    pub api: ApiConfig,
}

#[derive(Debug, Default, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
        }
    }
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default)]
    pub level: LogLevel,
}

/// MQTT broker connection settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Broker hostname or IP address
    pub host: String,

    /// Broker TCP port
    pub port: u16,

    /// Prefix of the client identifier; a random suffix is appended per process
    pub client_id_prefix: String,

    /// How long to wait for the broker's CONNACK
    pub connect_timeout_secs: u64,

    /// MQTT keep-alive interval
    pub keep_alive_secs: u64,

    /// Let the transport re-establish a dropped link on its own
    pub auto_reconnect: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "broker.hivemq.com".to_string(),
            port: 1883,
            client_id_prefix: "SmartLightApp".to_string(),
            connect_timeout_secs: 5,
            keep_alive_secs: 60,
            auto_reconnect: false,
        }
    }
}

impl BrokerConfig {
    /// Build a process-unique client identifier (`<prefix>-<uuid>`).
    pub fn generate_client_id(&self) -> String {
        format!("{}-{}", self.client_id_prefix, uuid::Uuid::new_v4())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }
}

/// The single device this controller drives
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Device identifier, used as one level of every topic
    pub id: String,

    /// First topic level, e.g. `smart-light` in `smart-light/light1/state`
    pub topic_base: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            id: "light1".to_string(),
            topic_base: "smart-light".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Quiet period before a brightness change is published
    pub brightness_debounce_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            brightness_debounce_ms: 500,
        }
    }
}

impl SessionConfig {
    pub fn brightness_debounce(&self) -> Duration {
        Duration::from_millis(self.brightness_debounce_ms)
    }
}

/// HTTP API configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub listen: String,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: "127.0.0.1".to_string(),
            port: 8565,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(path.as_ref().to_path_buf(), e))?;

        Self::from_toml(&contents)
    }

    /// Parse and validate configuration from a TOML string
    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker.host.trim().is_empty() {
            return Err(ConfigError::Invalid("broker.host must not be empty".to_string()));
        }
        // rumqttc rejects client ids that are empty or start with a space
        if self.broker.client_id_prefix.is_empty()
            || self.broker.client_id_prefix.starts_with(char::is_whitespace)
        {
            return Err(ConfigError::Invalid(format!(
                "broker.client_id_prefix must be non-empty and not start with whitespace: '{}'",
                self.broker.client_id_prefix
            )));
        }
        if self.broker.port == 0 {
            return Err(ConfigError::Invalid("broker.port must not be 0".to_string()));
        }
        if self.broker.keep_alive_secs < 5 {
            return Err(ConfigError::Invalid(format!(
                "broker.keep_alive_secs must be at least 5, got {}",
                self.broker.keep_alive_secs
            )));
        }
        if self.broker.connect_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "broker.connect_timeout_secs must be at least 1".to_string(),
            ));
        }

        validate_topic_level("device.id", &self.device.id, true)?;
        validate_topic_level("device.topic_base", &self.device.topic_base, false)?;

        Ok(())
    }
}

/// Topic segments must not carry wildcards; the device id must also be a single level.
fn validate_topic_level(field: &str, value: &str, single_level: bool) -> Result<(), ConfigError> {
    if value.is_empty() {
        return Err(ConfigError::Invalid(format!("{} must not be empty", field)));
    }
    if value.contains(['+', '#']) {
        return Err(ConfigError::Invalid(format!(
            "{} must not contain MQTT wildcards: '{}'",
            field, value
        )));
    }
    if single_level && value.contains('/') {
        return Err(ConfigError::Invalid(format!(
            "{} must be a single topic level: '{}'",
            field, value
        )));
    }
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
