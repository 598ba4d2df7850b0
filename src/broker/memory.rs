//! In-process broker
//!
//! Implements [`BrokerTransport`] without any networking. Messages travel
//! over a broadcast bus and are matched against each client's subscription
//! the way an MQTT broker would, including delivery of a client's own
//! publishes. Knobs exist to refuse connections, withhold CONNACK, reject
//! subscriptions and drop every client, which is what bridge tests need.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tracing::trace;

use super::{BrokerCommand, BrokerEvent, BrokerLink, BrokerTarget, BrokerTransport};
use crate::error::BridgeError;
use crate::topic::topic_matches_filter;

const BUS_CAPACITY: usize = 1024;

struct Inner {
    bus: broadcast::Sender<(String, Bytes)>,
    kick: broadcast::Sender<()>,
    connect_attempts: AtomicUsize,
    active_clients: AtomicUsize,
    refuse_connections: AtomicBool,
    hold_connack: AtomicBool,
    reject_subscriptions: AtomicBool,
    targets: Mutex<Vec<BrokerTarget>>,
}

/// In-process broker shared by every client it hands out
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        let (bus, _) = broadcast::channel(BUS_CAPACITY);
        let (kick, _) = broadcast::channel(16);
        Self {
            inner: Arc::new(Inner {
                bus,
                kick,
                connect_attempts: AtomicUsize::new(0),
                active_clients: AtomicUsize::new(0),
                refuse_connections: AtomicBool::new(false),
                hold_connack: AtomicBool::new(false),
                reject_subscriptions: AtomicBool::new(false),
                targets: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Publish as an external client
    pub fn publish(&self, topic: impl Into<String>, payload: impl Into<Bytes>) {
        let _ = self.inner.bus.send((topic.into(), payload.into()));
    }

    /// Subscribe as an external client
    pub fn subscribe(&self, filter: impl Into<String>) -> MemorySubscription {
        MemorySubscription {
            filter: filter.into(),
            rx: self.inner.bus.subscribe(),
        }
    }

    /// Number of `open` calls seen so far
    pub fn connect_attempts(&self) -> usize {
        self.inner.connect_attempts.load(Ordering::SeqCst)
    }

    /// Clients whose connection is currently up
    pub fn active_clients(&self) -> usize {
        self.inner.active_clients.load(Ordering::SeqCst)
    }

    /// Targets of every `open` call, in order
    pub fn targets(&self) -> Vec<BrokerTarget> {
        self.inner.targets.lock().clone()
    }

    /// Wait until exactly `count` clients are connected
    pub async fn wait_for_clients(&self, count: usize) {
        while self.active_clients() != count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Drop every connected client as if the broker went away
    pub fn disconnect_all(&self) {
        let _ = self.inner.kick.send(());
    }

    pub fn set_refuse_connections(&self, refuse: bool) {
        self.inner.refuse_connections.store(refuse, Ordering::SeqCst);
    }

    /// Never acknowledge new connections
    pub fn set_hold_connack(&self, hold: bool) {
        self.inner.hold_connack.store(hold, Ordering::SeqCst);
    }

    pub fn set_reject_subscriptions(&self, reject: bool) {
        self.inner.reject_subscriptions.store(reject, Ordering::SeqCst);
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrokerTransport for MemoryBroker {
    async fn open(&self, target: BrokerTarget) -> Result<BrokerLink, BridgeError> {
        self.inner.connect_attempts.fetch_add(1, Ordering::SeqCst);
        self.inner.targets.lock().push(target.clone());

        let (command_tx, command_rx) = mpsc::channel(target.channel_capacity);
        let (event_tx, event_rx) = mpsc::channel(target.channel_capacity);

        let task = tokio::spawn(run_client(
            self.inner.clone(),
            target.client_id,
            command_rx,
            event_tx,
        ));

        Ok(BrokerLink {
            commands: command_tx,
            events: event_rx,
            tasks: vec![task.abort_handle()],
        })
    }
}

/// Decrements the active count however the client task ends
struct ActiveGuard(Arc<Inner>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.active_clients.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn run_client(
    inner: Arc<Inner>,
    client_id: String,
    mut commands: mpsc::Receiver<BrokerCommand>,
    events: mpsc::Sender<BrokerEvent>,
) {
    if inner.refuse_connections.load(Ordering::SeqCst) {
        let _ = events
            .send(BrokerEvent::Error(BridgeError::Broker(
                "connection refused".to_string(),
            )))
            .await;
        return;
    }

    let mut bus = inner.bus.subscribe();
    let mut kick = inner.kick.subscribe();
    let mut filter: Option<String> = None;

    inner.active_clients.fetch_add(1, Ordering::SeqCst);
    let _guard = ActiveGuard(inner.clone());

    if !inner.hold_connack.load(Ordering::SeqCst) {
        let _ = events.send(BrokerEvent::Connected).await;
    }

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(BrokerCommand::Subscribe { topic, .. }) => {
                    if inner.reject_subscriptions.load(Ordering::SeqCst) {
                        let _ = events
                            .send(BrokerEvent::Error(BridgeError::Broker(
                                "subscription rejected by broker".to_string(),
                            )))
                            .await;
                        return;
                    }
                    filter = Some(topic);
                    let _ = events.send(BrokerEvent::Subscribed).await;
                }
                Some(BrokerCommand::Publish { topic, payload, .. }) => {
                    trace!(client_id = %client_id, topic = %topic, "memory broker publish");
                    let _ = inner.bus.send((topic, payload));
                }
                Some(BrokerCommand::Disconnect) | None => {
                    let _ = events.send(BrokerEvent::Closed).await;
                    return;
                }
            },
            message = bus.recv() => match message {
                Ok((topic, payload)) => {
                    let matched = filter
                        .as_deref()
                        .is_some_and(|f| topic_matches_filter(&topic, f));
                    if matched {
                        let message = BrokerEvent::Message { topic, payload };
                        if events.send(message).await.is_err() {
                            return;
                        }
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return,
            },
            _ = kick.recv() => {
                let _ = events.send(BrokerEvent::Closed).await;
                return;
            }
        }
    }
}

/// External subscriber on a [`MemoryBroker`]
pub struct MemorySubscription {
    filter: String,
    rx: broadcast::Receiver<(String, Bytes)>,
}

impl MemorySubscription {
    /// Next message matching the filter
    pub async fn recv(&mut self) -> Option<(String, Bytes)> {
        loop {
            match self.rx.recv().await {
                Ok((topic, payload)) if topic_matches_filter(&topic, &self.filter) => {
                    return Some((topic, payload))
                }
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next matching message if one is already queued
    pub fn try_recv(&mut self) -> Option<(String, Bytes)> {
        loop {
            match self.rx.try_recv() {
                Ok((topic, payload)) if topic_matches_filter(&topic, &self.filter) => {
                    return Some((topic, payload))
                }
                Ok(_) | Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}
