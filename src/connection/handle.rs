//! Connection Handle - caller-facing API for the connection manager task.
//!
//! Spawns the manager as a tokio task and talks to it through an action
//! channel; status flows back through a watch channel. The handle is cheap to
//! use from the UI layer: every operation enqueues a command, and calls that
//! expect a broker reply await a oneshot responder resolved by the manager.

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::error::ConnectionError;
use super::manager::{
    ConnectionManager, ConnectionState, ConnectionStatus, LinkCommand, PublishOptions,
};
use crate::message::{HandlerRegistry, QoS};
use crate::transport::rumqtt::RumqttcTransport;
use crate::transport::{LinkOptions, SubscribeGrant, Transport};

/// Startup settings for one connection manager.
///
/// Mirrors what the owning UI layer knows at construction time: where to
/// connect, how, whether to do so immediately, and which handlers receive
/// inbound messages until they are replaced.
pub struct ManagerSettings {
    /// Broker endpoint as `host:port`; port defaults to 1883 when omitted
    pub endpoint: String,
    pub options: LinkOptions,
    /// Open the broker link during initialization instead of waiting for an
    /// explicit connect request
    pub auto_connect: bool,
    pub handlers: HandlerRegistry,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            options: LinkOptions::default(),
            auto_connect: true,
            handlers: HandlerRegistry::new(),
        }
    }
}

/// Handle for one spawned connection manager.
pub struct ConnectionHandle {
    commands: mpsc::Sender<LinkCommand>,
    status: watch::Receiver<ConnectionStatus>,
    task_handle: Option<JoinHandle<()>>,
}

impl ConnectionHandle {
    /// Spawns a manager backed by the rumqttc transport.
    pub fn spawn(settings: ManagerSettings) -> Self {
        Self::spawn_with_transport(Box::new(RumqttcTransport::new()), settings)
    }

    /// Spawns a manager with a caller-provided transport.
    pub fn spawn_with_transport(transport: Box<dyn Transport>, settings: ManagerSettings) -> Self {
        info!("Spawning connection manager for '{}'", settings.endpoint);

        let (command_tx, command_rx) = mpsc::channel(100);
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::default());

        let manager = ConnectionManager::create(transport, command_rx, status_tx, settings);
        let task_handle = tokio::spawn(async move {
            manager.initialize().run().await;
        });

        Self {
            commands: command_tx,
            status: status_rx,
            task_handle: Some(task_handle),
        }
    }

    /// Latest published status snapshot.
    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.status.borrow().state
    }

    pub fn last_error(&self) -> Option<ConnectionError> {
        self.status.borrow().last_error.clone()
    }

    /// Independent receiver for reacting to status changes.
    pub fn status_receiver(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    /// Requests a connection to `endpoint`. A no-op while the manager is
    /// already connected or reconnecting; an empty endpoint is recorded as a
    /// configuration error without failing this call.
    pub async fn connect(
        &self,
        endpoint: impl Into<String>,
        options: LinkOptions,
    ) -> Result<(), ConnectionError> {
        self.send(LinkCommand::Connect {
            endpoint: endpoint.into(),
            options,
        })
        .await
    }

    /// Requests a disconnect. Idempotent.
    pub async fn disconnect(&self) -> Result<(), ConnectionError> {
        self.send(LinkCommand::Disconnect).await
    }

    /// Enqueues a publish. Requires the Connected state; failures are
    /// recorded in the published status rather than returned here.
    pub async fn publish(
        &self,
        topic: impl Into<String>,
        payload: impl Into<Vec<u8>>,
        options: PublishOptions,
    ) -> Result<(), ConnectionError> {
        self.send(LinkCommand::Publish {
            topic: topic.into(),
            payload: payload.into(),
            options,
        })
        .await
    }

    /// Subscribes to an exact topic filter and resolves with the broker's
    /// grant, or an error when the manager is not connected or the broker
    /// refuses the filter.
    pub async fn subscribe(
        &self,
        topic: impl Into<String>,
        qos: QoS,
    ) -> Result<SubscribeGrant, ConnectionError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send(LinkCommand::Subscribe {
            topic: topic.into(),
            qos,
            response_tx,
        })
        .await?;

        response_rx
            .await
            .map_err(|_| ConnectionError::Channel("subscribe reply dropped".to_string()))?
    }

    /// Symmetric contract to [`subscribe`](Self::subscribe).
    pub async fn unsubscribe(&self, topic: impl Into<String>) -> Result<(), ConnectionError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send(LinkCommand::Unsubscribe {
            topic: topic.into(),
            response_tx,
        })
        .await?;

        response_rx
            .await
            .map_err(|_| ConnectionError::Channel("unsubscribe reply dropped".to_string()))?
    }

    /// Installs a new handler registry, read at the next dispatch. The live
    /// link is not disturbed.
    pub async fn replace_handlers(
        &self,
        registry: HandlerRegistry,
    ) -> Result<(), ConnectionError> {
        self.send(LinkCommand::ReplaceHandlers { registry }).await
    }

    async fn send(&self, command: LinkCommand) -> Result<(), ConnectionError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ConnectionError::Channel("connection manager task is gone".to_string()))
    }

    /// Disconnects and waits for the manager task to finish.
    pub async fn shutdown(mut self) {
        debug!("Shutting down connection handle");
        let _ = self.commands.send(LinkCommand::Disconnect).await;
        drop(self.commands);

        if let Some(handle) = self.task_handle.take() {
            if let Err(e) = handle.await {
                error!("Connection manager task panicked: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::{LinkRequest, MockTransport};
    use crate::transport::LinkEvent;
    use std::time::Duration;

    fn test_settings(auto_connect: bool) -> ManagerSettings {
        ManagerSettings {
            endpoint: "broker.local:1883".to_string(),
            auto_connect,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn connect_then_publish_reaches_transport() {
        let (transport, state) = MockTransport::new();
        let handle =
            ConnectionHandle::spawn_with_transport(Box::new(transport), test_settings(false));
        let mut status = handle.status_receiver();

        handle
            .connect("broker.local:1883", LinkOptions::default())
            .await
            .unwrap();
        status
            .wait_for(|s| s.state == ConnectionState::Connecting)
            .await
            .unwrap();

        state.emit_current(LinkEvent::ConnectAck);
        status
            .wait_for(|s| s.state == ConnectionState::Connected)
            .await
            .unwrap();

        handle
            .publish("chat/room1", "hi", PublishOptions::default())
            .await
            .unwrap();
        status.wait_for(|s| s.messages_sent == 1).await.unwrap();

        assert_eq!(
            state.requests(),
            vec![LinkRequest::Publish {
                topic: "chat/room1".to_string(),
                payload: b"hi".to_vec(),
                qos: QoS::AtMostOnce,
                retain: false,
            }]
        );

        handle.shutdown().await;
        assert!(state.shutdown_count() >= 1);
    }

    #[tokio::test]
    async fn subscribe_waits_for_grant() {
        let (transport, state) = MockTransport::new();
        let handle =
            ConnectionHandle::spawn_with_transport(Box::new(transport), test_settings(true));
        let mut status = handle.status_receiver();

        status
            .wait_for(|s| s.state == ConnectionState::Connecting)
            .await
            .unwrap();
        state.emit_current(LinkEvent::ConnectAck);
        status
            .wait_for(|s| s.state == ConnectionState::Connected)
            .await
            .unwrap();

        let emitter_state = state.clone();
        tokio::spawn(async move {
            loop {
                let has_request = emitter_state
                    .requests()
                    .iter()
                    .any(|r| matches!(r, LinkRequest::Subscribe { .. }));
                if has_request {
                    emitter_state
                        .emit_current(LinkEvent::SubscribeAck(vec![Some(QoS::AtLeastOnce)]));
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });

        let grant = handle
            .subscribe("chat/room1", QoS::AtLeastOnce)
            .await
            .unwrap();
        assert_eq!(grant.topic, "chat/room1");
        assert_eq!(grant.qos, QoS::AtLeastOnce);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn subscribe_fails_fast_while_disconnected() {
        let (transport, state) = MockTransport::new();
        let handle =
            ConnectionHandle::spawn_with_transport(Box::new(transport), test_settings(false));

        let result = handle.subscribe("chat/room1", QoS::AtMostOnce).await;
        assert!(matches!(result, Err(ConnectionError::NotConnected(_))));
        assert_eq!(state.open_count(), 0);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn inbound_messages_reach_topic_handlers() {
        let (message_tx, mut message_rx) = mpsc::channel(8);
        let handlers = HandlerRegistry::new().on_topic(
            "chat/room1",
            Box::new(move |msg| {
                let _ = message_tx.try_send(msg.text());
            }),
        );

        let (transport, state) = MockTransport::new();
        let settings = ManagerSettings {
            endpoint: "broker.local:1883".to_string(),
            auto_connect: true,
            handlers,
            ..Default::default()
        };
        let handle = ConnectionHandle::spawn_with_transport(Box::new(transport), settings);
        let mut status = handle.status_receiver();

        status
            .wait_for(|s| s.state == ConnectionState::Connecting)
            .await
            .unwrap();
        state.emit_current(LinkEvent::ConnectAck);
        status
            .wait_for(|s| s.state == ConnectionState::Connected)
            .await
            .unwrap();

        state.emit_current(LinkEvent::Inbound(crate::message::InboundMessage::new(
            "chat/room2".to_string(),
            b"elsewhere".to_vec(),
            crate::message::PacketMeta::default(),
        )));
        state.emit_current(LinkEvent::Inbound(crate::message::InboundMessage::new(
            "chat/room1".to_string(),
            b"hello".to_vec(),
            crate::message::PacketMeta::default(),
        )));

        assert_eq!(message_rx.recv().await.unwrap(), "hello");
        status
            .wait_for(|s| s.messages_received == 2)
            .await
            .unwrap();

        handle.shutdown().await;
    }
}
