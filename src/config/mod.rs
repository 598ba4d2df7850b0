//! Configuration Module
//!
//! Provides TOML-based configuration for the bridge with support for:
//! - Listener settings (bind address, workers, TLS material)
//! - Broker connection parameters
//! - Per-session limits
//! - Shutdown timing
//! - Metrics endpoint
//! - Environment variable overrides (MQTTWS__* prefix)
//!
//! Precedence is flag > environment > file > default. Flags are applied by
//! the binary on top of the loaded [`Config`].

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

pub use metrics::MetricsConfig;

mod metrics;


/// Prefix for environment overrides, e.g. `MQTTWS__BROKER__HOST`
pub const ENV_PREFIX: &str = "MQTTWS";

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
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub log: LogConfig,
    /// WebSocket listener configuration
    pub server: ServerConfig,
    /// Broker connection configuration
    pub broker: BrokerConfig,
    /// Per-session limits
    pub limits: LimitsConfig,
    /// Shutdown timing
    pub shutdown: ShutdownConfig,
    /// Metrics configuration
    pub metrics: MetricsConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// WebSocket listener configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address for WebSocket clients
    pub bind: SocketAddr,
    /// Number of runtime worker threads (0 = auto)
    pub workers: usize,
    /// Time allowed for the TLS + WebSocket handshake
    #[serde(with = "humantime_serde")]
    pub handshake_timeout: Duration,
    /// TLS material; plaintext is served when absent or unusable
    pub tls: Option<ServerTlsConfig>,
}

/// TLS configuration for the listener
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ServerTlsConfig {
    /// Path to certificate chain (PEM format)
    #[serde(default)]
    pub cert: String,
    /// Path to private key (PEM format)
    #[serde(default)]
    pub key: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 8080)),
            workers: 0,
            handshake_timeout: Duration::from_secs(10),
            tls: None,
        }
    }
}

/// Broker connection configuration, shared by every session
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Broker host name or address
    pub host: String,
    /// Broker port
    pub port: u16,
    /// MQTT keep-alive interval
    #[serde(with = "humantime_serde")]
    pub keep_alive: Duration,
    /// Time allowed between starting a session and CONNACK
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Time allowed between SUBSCRIBE and SUBACK
    #[serde(with = "humantime_serde")]
    pub subscribe_timeout: Duration,
    /// Client id prefix; the session id is appended
    pub client_id_prefix: String,
    /// Default QoS for subscribe and publish (0, 1 or 2)
    pub qos: u8,
    /// Maximum MQTT packet size in bytes (0 = protocol maximum)
    pub max_packet_size: usize,
    /// Capacity of the per-session request channel towards the broker
    pub channel_capacity: usize,
    /// CA certificate (PEM) enabling TLS towards the broker
    pub ca_cert: Option<String>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            keep_alive: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(30),
            subscribe_timeout: Duration::from_secs(10),
            client_id_prefix: "ws_client".to_string(),
            qos: 0,
            max_packet_size: 0,
            channel_capacity: 256,
            ca_cert: None,
        }
    }
}

/// Per-session limits
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum concurrent sessions (0 = unlimited)
    pub max_connections: usize,
    /// Maximum WebSocket message size in bytes (0 = unlimited)
    pub max_frame_size: usize,
    /// Frames buffered towards one socket peer before backpressure
    pub outbound_channel_capacity: usize,
    /// Frames held while the broker subscription is being set up
    pub pending_frames: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: 1000,
            max_frame_size: 64 * 1024,
            outbound_channel_capacity: 1024,
            pending_frames: 256,
        }
    }
}

/// Shutdown timing
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// How long graceful shutdown waits for live sessions to close
    #[serde(with = "humantime_serde")]
    pub drain_timeout: Duration,
    /// How long a closing session waits for both sides to finish
    #[serde(with = "humantime_serde")]
    pub close_timeout: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout: Duration::from_secs(10),
            close_timeout: Duration::from_secs(5),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// Supports two forms of environment variable usage:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` syntax in the TOML file
    /// 2. Override via env vars: `MQTTWS__` prefix with double underscores for nesting:
    ///    - `MQTTWS__BROKER__HOST=mosquitto` overrides `broker.host`
    ///    - `MQTTWS__SERVER__BIND=0.0.0.0:9001` overrides `server.bind`
    ///
    /// A missing file is an error; callers fall back to [`Config::from_env`].
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::build(Some(&substitute_env_vars(&content)))
    }

    /// Load configuration with environment variable overrides only (no file).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::build(None)
    }

    fn build(content: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(content) = content {
            builder = builder.add_source(File::from_str(content, FileFormat::Toml));
        }

        // Double underscore separates nested keys, single underscore preserved in field names
        let cfg = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a string (for testing, no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker.qos > 2 {
            return Err(ConfigError::Validation(
                "broker.qos must be 0, 1, or 2".to_string(),
            ));
        }

        if self.broker.host.is_empty() {
            return Err(ConfigError::Validation(
                "broker.host cannot be empty".to_string(),
            ));
        }

        if self.broker.channel_capacity == 0 || self.limits.outbound_channel_capacity == 0 {
            return Err(ConfigError::Validation(
                "channel capacities must be greater than zero".to_string(),
            ));
        }

        if self.broker.connect_timeout.is_zero() || self.broker.subscribe_timeout.is_zero() {
            return Err(ConfigError::Validation(
                "broker timeouts must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }

    /// TLS certificate and key paths, when both are configured
    pub fn tls_paths(&self) -> Option<(&str, &str)> {
        self.server
            .tls
            .as_ref()
            .filter(|tls| !tls.cert.is_empty() && !tls.key.is_empty())
            .map(|tls| (tls.cert.as_str(), tls.key.as_str()))
    }
}
