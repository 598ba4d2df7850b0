//! mqttws - MQTT to WebSocket session bridge
//!
//! Each WebSocket peer gets its own MQTT client connection, subscribed to
//! the topic named by the request path. Broker messages are pushed to the
//! peer as `topic|payload` frames, and frames from the peer are published.

pub mod broker;
pub mod codec;
pub mod config;
pub mod error;
pub mod listener;
pub mod metrics;
pub mod session;
pub mod topic;
pub mod transport;

pub use broker::{BrokerTransport, MqttTransport};
#[cfg(any(test, feature = "test-util"))]
pub use broker::MemoryBroker;
pub use config::Config;
pub use error::BridgeError;
pub use listener::Listener;
pub use metrics::{Metrics, MetricsServer};
pub use session::{Session, SessionHandle, SessionState};
