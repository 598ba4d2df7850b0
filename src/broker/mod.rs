//! Broker Session Client
//!
//! Owns exactly one broker connection for one bridge session. The wire
//! protocol lives behind [`BrokerTransport`]; the client only sees a command
//! channel going out and an event channel coming back:
//!
//! ```text
//!  BrokerClient ──BrokerCommand──▶ transport tasks ──▶ broker
//!  BrokerClient ◀──BrokerEvent──── transport tasks ◀── broker
//! ```
//!
//! [`MqttTransport`] talks MQTT 3.1.1 over TCP or TLS. With the `test-util`
//! feature, `MemoryBroker` provides an in-process broker with the same
//! semantics for tests.

#[cfg(any(test, feature = "test-util"))]
mod memory;
mod mqtt;
mod options;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::error::BridgeError;

#[cfg(any(test, feature = "test-util"))]
pub use memory::{MemoryBroker, MemorySubscription};
pub use mqtt::MqttTransport;
pub use options::BrokerTarget;

/// Quality of service for subscribe and publish
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QoS {
    #[default]
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl QoS {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(QoS::AtMostOnce),
            1 => Some(QoS::AtLeastOnce),
            2 => Some(QoS::ExactlyOnce),
            _ => None,
        }
    }
}

/// Request sent from the client to its transport
#[derive(Debug)]
pub enum BrokerCommand {
    Subscribe { topic: String, qos: QoS },
    Publish { topic: String, payload: Bytes, qos: QoS },
    Disconnect,
}

/// Notification sent from the transport to the client
#[derive(Debug)]
pub enum BrokerEvent {
    /// Connection acknowledged by the broker
    Connected,
    /// Subscription acknowledged by the broker
    Subscribed,
    /// Message delivered for the subscribed topic
    Message { topic: String, payload: Bytes },
    /// Connection closed; no further events follow
    Closed,
    /// Connection failed; no further events follow
    Error(BridgeError),
}

/// Live connection handed out by a transport
pub struct BrokerLink {
    pub commands: mpsc::Sender<BrokerCommand>,
    /// Bounded; a session that stops reading stalls its transport
    pub events: mpsc::Receiver<BrokerEvent>,
    /// Tasks driving the connection, aborted when the client is dropped
    pub tasks: Vec<AbortHandle>,
}

/// A broker protocol implementation
#[async_trait]
pub trait BrokerTransport: Send + Sync + 'static {
    /// Start connecting to `target`.
    ///
    /// Must return without waiting for the broker handshake; its outcome is
    /// reported as [`BrokerEvent::Connected`] or [`BrokerEvent::Error`].
    async fn open(&self, target: BrokerTarget) -> Result<BrokerLink, BridgeError>;
}

/// Status of a broker client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerStatus {
    /// Handshake in progress
    Connecting,
    /// Connection acknowledged
    Connected,
    /// Closed locally or by the broker
    Closed,
}

/// One broker connection, owned by one session
pub struct BrokerClient {
    target: BrokerTarget,
    topic: Option<String>,
    status: BrokerStatus,
    close_requested: bool,
    commands: mpsc::Sender<BrokerCommand>,
    events: mpsc::Receiver<BrokerEvent>,
    tasks: Vec<AbortHandle>,
}

impl BrokerClient {
    /// Initiate a connection. Returns as soon as the transport is started.
    pub async fn connect(
        transport: &dyn BrokerTransport,
        target: BrokerTarget,
    ) -> Result<Self, BridgeError> {
        debug!(
            client_id = %target.client_id,
            broker = %target.addr(),
            "Connecting to broker"
        );

        let link = transport.open(target.clone()).await?;

        Ok(Self {
            target,
            topic: None,
            status: BrokerStatus::Connecting,
            close_requested: false,
            commands: link.commands,
            events: link.events,
            tasks: link.tasks,
        })
    }

    pub fn client_id(&self) -> &str {
        &self.target.client_id
    }

    pub fn target(&self) -> &BrokerTarget {
        &self.target
    }

    /// Subscribed topic, once [`subscribe`](Self::subscribe) was called
    pub fn topic(&self) -> Option<&str> {
        self.topic.as_deref()
    }

    pub fn status(&self) -> BrokerStatus {
        self.status
    }

    pub fn is_connected(&self) -> bool {
        self.status == BrokerStatus::Connected
    }

    /// Subscribe to the session topic. A client holds a single subscription.
    pub async fn subscribe(&mut self, topic: &str) -> Result<(), BridgeError> {
        if let Some(existing) = &self.topic {
            return Err(BridgeError::Broker(format!(
                "client already subscribed to '{}'",
                existing
            )));
        }

        self.send(BrokerCommand::Subscribe {
            topic: topic.to_string(),
            qos: self.target.qos,
        })
        .await?;
        self.topic = Some(topic.to_string());
        Ok(())
    }

    /// Publish an opaque payload, not retained
    pub async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), BridgeError> {
        self.send(BrokerCommand::Publish {
            topic: topic.to_string(),
            payload,
            qos: self.target.qos,
        })
        .await
    }

    /// Publish-only handle that can run on another task
    pub fn publisher(&self) -> BrokerPublisher {
        BrokerPublisher {
            commands: self.commands.clone(),
            qos: self.target.qos,
        }
    }

    async fn send(&self, command: BrokerCommand) -> Result<(), BridgeError> {
        if self.close_requested || self.status == BrokerStatus::Closed {
            return Err(BridgeError::Broker("broker connection is closed".to_string()));
        }
        self.commands
            .send(command)
            .await
            .map_err(|_| BridgeError::Broker("broker connection is closed".to_string()))
    }

    /// Next event from the broker, `None` once the transport is gone
    pub async fn recv(&mut self) -> Option<BrokerEvent> {
        let event = self.events.recv().await;
        match &event {
            Some(BrokerEvent::Connected) => self.status = BrokerStatus::Connected,
            Some(BrokerEvent::Closed) | Some(BrokerEvent::Error(_)) | None => {
                self.status = BrokerStatus::Closed
            }
            _ => {}
        }
        event
    }

    /// Ask the broker to disconnect. Calling it again is a no-op.
    pub async fn close(&mut self) {
        if self.close_requested || self.status == BrokerStatus::Closed {
            return;
        }
        self.close_requested = true;

        if self.commands.send(BrokerCommand::Disconnect).await.is_err() {
            self.status = BrokerStatus::Closed;
        }
    }

    /// Close and wait for the transport to confirm, up to `timeout`.
    ///
    /// Returns `true` if the connection closed in time. Transport tasks are
    /// aborted either way.
    pub async fn shutdown(&mut self, timeout: Duration) -> bool {
        self.close().await;

        let closed = tokio::time::timeout(timeout, async {
            while self.status != BrokerStatus::Closed {
                if self.recv().await.is_none() {
                    break;
                }
            }
        })
        .await
        .is_ok();

        if !closed {
            warn!(
                client_id = %self.target.client_id,
                "Broker did not confirm disconnect within {:?}", timeout
            );
        }

        self.abort();
        closed
    }

    fn abort(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.status = BrokerStatus::Closed;
    }
}

/// Publishing half of a [`BrokerClient`]
#[derive(Debug, Clone)]
pub struct BrokerPublisher {
    commands: mpsc::Sender<BrokerCommand>,
    qos: QoS,
}

impl BrokerPublisher {
    /// Publish an opaque payload, not retained. Waits while the transport's
    /// command queue is full.
    pub async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), BridgeError> {
        self.commands
            .send(BrokerCommand::Publish {
                topic: topic.to_string(),
                payload,
                qos: self.qos,
            })
            .await
            .map_err(|_| BridgeError::Broker("broker connection is closed".to_string()))
    }
}

impl Drop for BrokerClient {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl fmt::Debug for BrokerClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerClient")
            .field("client_id", &self.target.client_id)
            .field("broker", &self.target.addr())
            .field("topic", &self.topic)
            .field("status", &self.status)
            .finish()
    }
}
