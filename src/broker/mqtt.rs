//! MQTT 3.1.1 transport built on `rumqttc`
//!
//! Each connection runs two tasks: one polls the event loop and turns
//! packets into [`BrokerEvent`]s, the other forwards [`BrokerCommand`]s to
//! the client handle. The event loop is never restarted; a lost connection
//! ends the session that owns it.

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, SubscribeReasonCode,
    TlsConfiguration, Transport,
};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::{BrokerCommand, BrokerEvent, BrokerLink, BrokerTarget, BrokerTransport, QoS};
use crate::error::BridgeError;

impl From<QoS> for rumqttc::QoS {
    fn from(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
            QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
            QoS::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
        }
    }
}

/// Largest packet MQTT 3.1.1 can frame (maximum remaining length plus
/// a five byte fixed header)
pub const MAX_PACKET_SIZE: usize = 268_435_455 + 5;

/// Connects sessions to a real MQTT broker
#[derive(Debug, Clone, Default)]
pub struct MqttTransport;

impl MqttTransport {
    pub fn new() -> Self {
        Self
    }

    async fn options(target: &BrokerTarget) -> Result<MqttOptions, BridgeError> {
        let mut options = MqttOptions::new(&target.client_id, &target.host, target.port);
        options.set_keep_alive(target.keep_alive);
        options.set_clean_session(target.clean_session);

        if let Some(username) = &target.username {
            options.set_credentials(username, target.password.clone().unwrap_or_default());
        }

        // rumqttc defaults to 10 KiB each way; 0 means no limit beyond the protocol's
        let max_packet_size = match target.max_packet_size {
            0 => MAX_PACKET_SIZE,
            size => size,
        };
        options.set_max_packet_size(max_packet_size, max_packet_size);

        if let Some(ca_path) = &target.ca_cert {
            let ca = tokio::fs::read(ca_path).await.map_err(|e| {
                BridgeError::Broker(format!("failed to read CA certificate {}: {}", ca_path, e))
            })?;
            options.set_transport(Transport::tls_with_config(TlsConfiguration::Simple {
                ca,
                alpn: None,
                client_auth: None,
            }));
        }

        Ok(options)
    }
}

#[async_trait]
impl BrokerTransport for MqttTransport {
    async fn open(&self, target: BrokerTarget) -> Result<BrokerLink, BridgeError> {
        let options = Self::options(&target).await?;
        let (client, eventloop) = AsyncClient::new(options, target.channel_capacity);

        let (command_tx, command_rx) = mpsc::channel(target.channel_capacity);
        let (event_tx, event_rx) = mpsc::channel(target.channel_capacity);

        let poller = tokio::spawn(poll_loop(eventloop, event_tx.clone()));
        let forwarder = tokio::spawn(command_loop(client, command_rx, event_tx));

        Ok(BrokerLink {
            commands: command_tx,
            events: event_rx,
            tasks: vec![poller.abort_handle(), forwarder.abort_handle()],
        })
    }
}

async fn poll_loop(mut eventloop: EventLoop, events: mpsc::Sender<BrokerEvent>) {
    loop {
        let event = match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => BrokerEvent::Connected,
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                let rejected = ack
                    .return_codes
                    .iter()
                    .any(|code| matches!(code, SubscribeReasonCode::Failure));
                if rejected {
                    BrokerEvent::Error(BridgeError::Broker(
                        "subscription rejected by broker".to_string(),
                    ))
                } else {
                    BrokerEvent::Subscribed
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => BrokerEvent::Message {
                topic: publish.topic,
                payload: publish.payload,
            },
            Ok(Event::Incoming(Packet::Disconnect)) | Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                let _ = events.send(BrokerEvent::Closed).await;
                return;
            }
            Ok(other) => {
                trace!(event = ?other, "MQTT event");
                continue;
            }
            Err(e) => {
                debug!(error = %e, "MQTT event loop stopped");
                let _ = events
                    .send(BrokerEvent::Error(BridgeError::Broker(e.to_string())))
                    .await;
                return;
            }
        };

        let terminal = matches!(event, BrokerEvent::Error(_));
        if events.send(event).await.is_err() || terminal {
            return;
        }
    }
}

async fn command_loop(
    client: AsyncClient,
    mut commands: mpsc::Receiver<BrokerCommand>,
    events: mpsc::Sender<BrokerEvent>,
) {
    while let Some(command) = commands.recv().await {
        let result = match command {
            BrokerCommand::Subscribe { topic, qos } => client.subscribe(topic, qos.into()).await,
            BrokerCommand::Publish {
                topic,
                payload,
                qos,
            } => client.publish_bytes(topic, qos.into(), false, payload).await,
            BrokerCommand::Disconnect => {
                // The event loop is already gone; nobody else will report the close
                if client.disconnect().await.is_err() {
                    let _ = events.send(BrokerEvent::Closed).await;
                }
                return;
            }
        };

        if let Err(e) = result {
            let _ = events
                .send(BrokerEvent::Error(BridgeError::Broker(e.to_string())))
                .await;
            return;
        }
    }
}
