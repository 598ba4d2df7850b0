//! Bridge Error Taxonomy
//!
//! Every failure the bridge can observe maps onto one of these variants.
//! The variant decides the blast radius:
//! - `MalformedRequest`: the upgrade is rejected, no session is created
//! - `MalformedMessage`: a single frame is dropped, the session stays open
//! - `BrokerTimeout`, `Broker`, `Socket`: the owning session closes
//! - `Overloaded`: the upgrade is refused with 503
//! - `Config`: logged at startup, defaults are used
//! - `Bind`: fatal at startup

use std::fmt;
use std::net::SocketAddr;

use tokio_tungstenite::tungstenite;

use crate::codec::FrameError;
use crate::config::ConfigError;

/// Bridge error type
#[derive(Debug)]
pub enum BridgeError {
    /// Topic could not be derived from the connection request
    MalformedRequest(String),
    /// A socket frame could not be relayed
    MalformedMessage(String),
    /// Broker did not answer a connect/subscribe within the allowed time
    BrokerTimeout(String),
    /// Broker connect, subscribe or publish failed
    Broker(String),
    /// Socket peer transport failed
    Socket(String),
    /// Listener is at its session limit
    Overloaded(String),
    /// Configuration could not be loaded
    Config(String),
    /// Listen socket could not be acquired
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
}

impl BridgeError {
    /// Short stable label, used for metrics and log fields
    pub fn kind(&self) -> &'static str {
        match self {
            BridgeError::MalformedRequest(_) => "malformed_request",
            BridgeError::MalformedMessage(_) => "malformed_message",
            BridgeError::BrokerTimeout(_) => "broker_timeout",
            BridgeError::Broker(_) => "broker_error",
            BridgeError::Socket(_) => "socket_error",
            BridgeError::Overloaded(_) => "overloaded",
            BridgeError::Config(_) => "config_error",
            BridgeError::Bind { .. } => "bind_error",
        }
    }

    /// Whether this error ends the session it occurred in
    pub fn closes_session(&self) -> bool {
        !matches!(self, BridgeError::MalformedMessage(_))
    }
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BridgeError::MalformedRequest(msg) => write!(f, "Malformed request: {}", msg),
            BridgeError::MalformedMessage(msg) => write!(f, "Malformed message: {}", msg),
            BridgeError::BrokerTimeout(msg) => write!(f, "Broker timeout: {}", msg),
            BridgeError::Broker(msg) => write!(f, "Broker error: {}", msg),
            BridgeError::Socket(msg) => write!(f, "Socket error: {}", msg),
            BridgeError::Overloaded(msg) => write!(f, "Overloaded: {}", msg),
            BridgeError::Config(msg) => write!(f, "Config error: {}", msg),
            BridgeError::Bind { addr, source } => {
                write!(f, "Failed to bind {}: {}", addr, source)
            }
        }
    }
}

impl std::error::Error for BridgeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BridgeError::Bind { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<FrameError> for BridgeError {
    fn from(e: FrameError) -> Self {
        BridgeError::MalformedMessage(e.to_string())
    }
}

impl From<ConfigError> for BridgeError {
    fn from(e: ConfigError) -> Self {
        BridgeError::Config(e.to_string())
    }
}

impl From<tungstenite::Error> for BridgeError {
    fn from(e: tungstenite::Error) -> Self {
        BridgeError::Socket(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_malformed_message_keeps_session() {
        assert!(!BridgeError::MalformedMessage("x".into()).closes_session());
        assert!(BridgeError::Broker("x".into()).closes_session());
        assert!(BridgeError::BrokerTimeout("x".into()).closes_session());
        assert!(BridgeError::Socket("x".into()).closes_session());
    }

    #[test]
    fn test_bind_error_display() {
        let err = BridgeError::Bind {
            addr: "127.0.0.1:8080".parse().unwrap(),
            source: std::io::Error::new(std::io::ErrorKind::AddrInUse, "in use"),
        };
        assert!(err.to_string().contains("127.0.0.1:8080"));
        assert_eq!(err.kind(), "bind_error");
    }
}
