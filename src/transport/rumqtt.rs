//! rumqttc-backed [`Transport`] implementation.
//!
//! `open` builds the client from a `host:port` endpoint plus [`LinkOptions`]
//! and spawns an event pump that translates `EventLoop::poll` results into
//! [`LinkEvent`]s. Reconnect pacing lives here, not in the manager: after a
//! poll failure the pump reports `Fault` and `Reconnecting`, waits, and polls
//! again until its consecutive-failure budget is spent, at which point it
//! reports `Offline` and stops.

use std::time::Duration;

use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Packet, QoS};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{LinkEvent, LinkOptions, LinkSignal, Transport, TransportLink};
use crate::connection::error::ConnectionError;
use crate::message::{InboundMessage, PacketMeta};

pub struct RumqttcTransport;

impl RumqttcTransport {
    pub fn new() -> Self {
        Self
    }
}

impl Default for RumqttcTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for RumqttcTransport {
    fn open(
        &mut self,
        endpoint: &str,
        options: &LinkOptions,
        serial: u64,
        signals: mpsc::Sender<LinkSignal>,
    ) -> Result<Box<dyn TransportLink>, ConnectionError> {
        let (host, port) = split_endpoint(endpoint)?;

        let mut mqtt_options = MqttOptions::new(options.client_id.clone(), host, port);
        mqtt_options.set_keep_alive(Duration::from_secs(options.keep_alive_secs));
        if !options.username.is_empty() || !options.token.is_empty() {
            // Token travels in the password field, as the broker-side
            // authorizer expects it.
            mqtt_options.set_credentials(options.username.clone(), options.token.clone());
        }

        let (client, event_loop) = AsyncClient::new(mqtt_options, 100);

        let cancel = CancellationToken::new();
        let pump_cancel = cancel.clone();
        let retry_budget = options.max_reconnect_attempts;
        let retry_delay = Duration::from_millis(options.reconnect_delay_ms);

        info!("Opening MQTT link to {} (serial {})", endpoint, serial);
        tokio::spawn(async move {
            run_event_pump(event_loop, serial, signals, pump_cancel, retry_budget, retry_delay)
                .await;
        });

        Ok(Box::new(RumqttcLink { client, cancel }))
    }
}

pub struct RumqttcLink {
    client: AsyncClient,
    cancel: CancellationToken,
}

impl TransportLink for RumqttcLink {
    fn request_publish(
        &mut self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), ConnectionError> {
        self.client
            .try_publish(topic, qos, retain, payload)
            .map_err(|e| ConnectionError::Transport(format!("publish failed: {}", e)))
    }

    fn request_subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), ConnectionError> {
        self.client
            .try_subscribe(topic, qos)
            .map_err(|e| ConnectionError::Transport(format!("subscribe failed: {}", e)))
    }

    fn request_unsubscribe(&mut self, topic: &str) -> Result<(), ConnectionError> {
        self.client
            .try_unsubscribe(topic)
            .map_err(|e| ConnectionError::Transport(format!("unsubscribe failed: {}", e)))
    }

    fn shutdown(&mut self) {
        // Pump first, close second: once the token is cancelled no further
        // signals can reach the manager from this link.
        self.cancel.cancel();
        if let Err(e) = self.client.try_disconnect() {
            debug!("Disconnect request not delivered: {}", e);
        }
    }
}

async fn run_event_pump(
    mut event_loop: EventLoop,
    serial: u64,
    signals: mpsc::Sender<LinkSignal>,
    cancel: CancellationToken,
    retry_budget: usize,
    retry_delay: Duration,
) {
    let mut consecutive_failures: usize = 0;

    loop {
        let polled = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Event pump cancelled (serial {})", serial);
                return;
            }
            polled = event_loop.poll() => polled,
        };

        match polled {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    consecutive_failures = 0;
                    if !send(&signals, serial, LinkEvent::ConnectAck).await {
                        return;
                    }
                } else {
                    let fault = format!("broker refused connection: {:?}", ack.code);
                    warn!("{}", fault);
                    if !send(&signals, serial, LinkEvent::Fault(fault)).await {
                        return;
                    }
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let message = InboundMessage::new(
                    publish.topic.clone(),
                    publish.payload.to_vec(),
                    PacketMeta {
                        qos: publish.qos,
                        retain: publish.retain,
                        dup: publish.dup,
                        packet_id: publish.pkid,
                    },
                );
                if !send(&signals, serial, LinkEvent::Inbound(message)).await {
                    return;
                }
            }
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                let grants = ack
                    .return_codes
                    .iter()
                    .map(|code| match code {
                        rumqttc::SubscribeReasonCode::Success(qos) => Some(*qos),
                        rumqttc::SubscribeReasonCode::Failure => None,
                    })
                    .collect();
                if !send(&signals, serial, LinkEvent::SubscribeAck(grants)).await {
                    return;
                }
            }
            Ok(Event::Incoming(Packet::UnsubAck(_))) => {
                if !send(&signals, serial, LinkEvent::UnsubscribeAck).await {
                    return;
                }
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                info!("Broker closed the connection (serial {})", serial);
                let _ = send(&signals, serial, LinkEvent::Closed).await;
                return;
            }
            Ok(_) => {}
            Err(e) => {
                consecutive_failures += 1;
                let fault = e.to_string();
                warn!(
                    "Transport error (attempt {}/{}): {}",
                    consecutive_failures, retry_budget, fault
                );
                if !send(&signals, serial, LinkEvent::Fault(fault)).await {
                    return;
                }

                if consecutive_failures > retry_budget {
                    warn!("Reconnect attempts exhausted, going offline (serial {})", serial);
                    let _ = send(&signals, serial, LinkEvent::Offline).await;
                    return;
                }

                if !send(&signals, serial, LinkEvent::Reconnecting).await {
                    return;
                }

                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(retry_delay) => {}
                }
            }
        }
    }
}

async fn send(signals: &mpsc::Sender<LinkSignal>, serial: u64, event: LinkEvent) -> bool {
    signals.send(LinkSignal { serial, event }).await.is_ok()
}

/// Splits `host:port` (with an optional `mqtt://` or `tcp://` prefix) into
/// its parts, defaulting to port 1883.
fn split_endpoint(endpoint: &str) -> Result<(String, u16), ConnectionError> {
    let trimmed = endpoint
        .strip_prefix("mqtt://")
        .or_else(|| endpoint.strip_prefix("tcp://"))
        .unwrap_or(endpoint);

    let mut parts = trimmed.split(':');
    let host = parts.next().unwrap_or_default();
    if host.is_empty() {
        return Err(ConnectionError::Configuration(format!(
            "invalid broker endpoint: {}",
            endpoint
        )));
    }

    let port = match parts.next() {
        Some(raw) => raw.parse().map_err(|_| {
            ConnectionError::Configuration(format!("invalid broker port in: {}", endpoint))
        })?,
        None => 1883,
    };

    Ok((host.to_string(), port))
}
