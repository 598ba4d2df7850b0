//! Broker connection target
//!
//! Combines the process-wide broker settings with the per-connection options
//! a socket peer passed in its query string.

use std::time::Duration;

use super::QoS;
use crate::config::BrokerConfig;
use crate::error::BridgeError;
use crate::topic::ConnectionOptions;

/// Everything a transport needs to open one broker connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerTarget {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive: Duration,
    pub clean_session: bool,
    pub qos: QoS,
    /// 0 allows the largest packet MQTT can frame
    pub max_packet_size: usize,
    pub channel_capacity: usize,
    /// CA certificate path, enables TLS when set
    pub ca_cert: Option<String>,
}

impl BrokerTarget {
    /// Target built from configuration alone
    pub fn new(config: &BrokerConfig, client_id: impl Into<String>) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            client_id: client_id.into(),
            username: None,
            password: None,
            keep_alive: whole_seconds(config.keep_alive),
            clean_session: true,
            qos: QoS::from_u8(config.qos).unwrap_or_default(),
            max_packet_size: config.max_packet_size,
            channel_capacity: config.channel_capacity.max(1),
            ca_cert: config.ca_cert.clone(),
        }
    }

    /// Apply per-connection options on top of the configured defaults.
    ///
    /// Recognised keys: `clientId`/`client_id`, `username`, `password`,
    /// `keepAlive`/`keep_alive` (seconds), `cleanSession`/`clean_session`,
    /// `qos`. Anything else is refused.
    pub fn from_options(
        config: &BrokerConfig,
        default_client_id: impl Into<String>,
        options: &ConnectionOptions,
    ) -> Result<Self, BridgeError> {
        let mut target = Self::new(config, default_client_id);

        for (key, value) in options.iter() {
            match key {
                "clientId" | "client_id" => {
                    if value.is_empty() || value.starts_with(char::is_whitespace) {
                        return Err(invalid_value(key, value));
                    }
                    target.client_id = value.to_string();
                }
                "username" => target.username = Some(value.to_string()),
                "password" => target.password = Some(value.to_string()),
                "keepAlive" | "keep_alive" => {
                    let secs: u16 = value.parse().map_err(|_| invalid_value(key, value))?;
                    target.keep_alive = Duration::from_secs(secs.into());
                }
                "cleanSession" | "clean_session" => {
                    target.clean_session =
                        parse_bool(value).ok_or_else(|| invalid_value(key, value))?;
                }
                "qos" => {
                    target.qos = value
                        .parse::<u8>()
                        .ok()
                        .and_then(QoS::from_u8)
                        .ok_or_else(|| invalid_value(key, value))?;
                }
                _ => {
                    return Err(BridgeError::Broker(format!(
                        "unsupported connection option '{}'",
                        key
                    )))
                }
            }
        }

        if target.password.is_some() && target.username.is_none() {
            return Err(BridgeError::Broker(
                "password option requires a username".to_string(),
            ));
        }

        Ok(target)
    }

    /// `host:port` of the broker
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn invalid_value(key: &str, value: &str) -> BridgeError {
    BridgeError::Broker(format!(
        "invalid value '{}' for connection option '{}'",
        value, key
    ))
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}

// MQTT keep-alive has one second resolution
fn whole_seconds(duration: Duration) -> Duration {
    if duration.is_zero() {
        return duration;
    }
    Duration::from_secs(duration.as_secs().max(1))
}
