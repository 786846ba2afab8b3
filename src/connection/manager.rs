//! Connection state machine and manager task.
//!
//! The manager owns at most one broker link at a time and is the only writer
//! of the published [`ConnectionStatus`]. Its reported state is a pure
//! function of the last observed lifecycle event; the only caller-driven
//! transitions are the ones issued through commands (`Connecting` on connect,
//! `Disconnected` on explicit disconnect). Events from a superseded link are
//! discarded by comparing their serial against the currently-tracked one.

use std::collections::VecDeque;
use std::fmt;

use chrono::{DateTime, Local};
use statum::{machine, state};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use super::error::ConnectionError;
use super::handle::ManagerSettings;
use crate::message::{HandlerRegistry, InboundMessage, QoS};
use crate::transport::{
    LinkEvent, LinkOptions, LinkSignal, SubscribeGrant, Transport, TransportLink,
};

/// Lifecycle of one logical broker connection, as reported to the UI layer.
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Offline,
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
            ConnectionState::Reconnecting => "Reconnecting",
            ConnectionState::Offline => "Offline",
            ConnectionState::Error => "Error",
        };
        write!(f, "{}", name)
    }
}

/// Snapshot published through the status watch channel.
#[derive(Clone, Debug, Default)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub last_error: Option<ConnectionError>,
    pub messages_received: usize,
    pub messages_sent: usize,
    pub last_activity: Option<DateTime<Local>>,
}

/// Publish request options.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PublishOptions {
    pub qos: QoS,
    pub retain: bool,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            qos: QoS::AtMostOnce,
            retain: false,
        }
    }
}

// Aktion-Enum für den Verbindungs-Worker
pub enum LinkCommand {
    Connect {
        endpoint: String,
        options: LinkOptions,
    },
    Disconnect,
    Publish {
        topic: String,
        payload: Vec<u8>,
        options: PublishOptions,
    },
    Subscribe {
        topic: String,
        qos: QoS,
        response_tx: oneshot::Sender<Result<SubscribeGrant, ConnectionError>>,
    },
    Unsubscribe {
        topic: String,
        response_tx: oneshot::Sender<Result<(), ConnectionError>>,
    },
    ReplaceHandlers {
        registry: HandlerRegistry,
    },
}

struct PendingSubscribe {
    topic: String,
    response_tx: oneshot::Sender<Result<SubscribeGrant, ConnectionError>>,
}

struct PendingUnsubscribe {
    topic: String,
    response_tx: oneshot::Sender<Result<(), ConnectionError>>,
}

/// Manager task lifecycle states using statum
#[state]
#[derive(Debug, Clone)]
pub enum ManagerLifecycle {
    Initializing,
    Running,
}

#[machine]
pub struct ConnectionManager<S: ManagerLifecycle> {
    transport: Box<dyn Transport>,

    commands: mpsc::Receiver<LinkCommand>,

    status_tx: watch::Sender<ConnectionStatus>,

    // One signal channel for the manager's whole lifetime; links tag their
    // events with the serial they were opened under
    signals_tx: mpsc::Sender<LinkSignal>,
    signals_rx: mpsc::Receiver<LinkSignal>,

    registry: HandlerRegistry,

    // Owned resource slot: at most one live link
    link: Option<Box<dyn TransportLink>>,
    link_serial: u64,

    status: ConnectionStatus,

    endpoint: String,
    options: LinkOptions,
    auto_connect: bool,

    pending_subscribes: VecDeque<PendingSubscribe>,
    pending_unsubscribes: VecDeque<PendingUnsubscribe>,
}

impl<S: ManagerLifecycle> ConnectionManager<S> {
    fn push_status(&self) {
        let _ = self.status_tx.send(self.status.clone());
    }

    fn set_state(&mut self, next: ConnectionState) {
        if self.status.state != next {
            info!("Connection state {} -> {}", self.status.state, next);
            self.status.state = next;
        }
        self.push_status();
    }

    fn record_error(&mut self, error: ConnectionError) {
        self.status.last_error = Some(error);
        self.push_status();
    }

    /// Detaches the current link (pump cancelled before close is requested)
    /// and fails every caller still waiting on a broker reply.
    fn teardown_link(&mut self) {
        if let Some(mut link) = self.link.take() {
            debug!("Tearing down broker link (serial {})", self.link_serial);
            link.shutdown();
        }
        self.fail_pending("connection closed before the broker replied");
    }

    fn fail_pending(&mut self, reason: &str) {
        for pending in self.pending_subscribes.drain(..) {
            let _ = pending
                .response_tx
                .send(Err(ConnectionError::NotConnected(reason.to_string())));
        }
        for pending in self.pending_unsubscribes.drain(..) {
            let _ = pending
                .response_tx
                .send(Err(ConnectionError::NotConnected(reason.to_string())));
        }
    }

    /// Connect request. No-op while the current link is `Connected` or
    /// `Reconnecting`; otherwise any stale link is fully torn down before the
    /// replacement is created.
    fn open_link(&mut self, endpoint: String, options: LinkOptions) {
        if self.link.is_some()
            && matches!(
                self.status.state,
                ConnectionState::Connected | ConnectionState::Reconnecting
            )
        {
            debug!("Link already connected or reconnecting, ignoring connect request");
            return;
        }

        if endpoint.is_empty() {
            warn!("No broker endpoint configured");
            self.teardown_link();
            self.status.state = ConnectionState::Disconnected;
            self.status.last_error = Some(ConnectionError::Configuration(
                "broker endpoint is not configured".to_string(),
            ));
            self.push_status();
            return;
        }

        self.teardown_link();
        self.endpoint = endpoint;
        self.options = options;

        self.status.state = ConnectionState::Connecting;
        self.status.last_error = None;
        self.push_status();

        self.link_serial += 1;
        info!(
            "Connecting to broker {} (serial {})",
            self.endpoint, self.link_serial
        );
        match self.transport.open(
            &self.endpoint,
            &self.options,
            self.link_serial,
            self.signals_tx.clone(),
        ) {
            Ok(link) => {
                self.link = Some(link);
            }
            Err(e) => {
                error!("Failed to open broker link: {}", e);
                self.status.state = ConnectionState::Error;
                self.status.last_error = Some(e);
                self.push_status();
            }
        }
    }
}

impl ConnectionManager<Initializing> {
    pub fn create(
        transport: Box<dyn Transport>,
        commands: mpsc::Receiver<LinkCommand>,
        status_tx: watch::Sender<ConnectionStatus>,
        settings: ManagerSettings,
    ) -> Self {
        debug!("Creating connection manager for '{}'", settings.endpoint);
        let (signals_tx, signals_rx) = mpsc::channel(256);

        Self::new(
            transport,
            commands,
            status_tx,
            signals_tx,
            signals_rx,
            settings.handlers,
            None, // link
            0,    // link_serial
            ConnectionStatus::default(),
            settings.endpoint,
            settings.options,
            settings.auto_connect,
            VecDeque::new(), // pending_subscribes
            VecDeque::new(), // pending_unsubscribes
        )
    }

    /// Publishes the initial status and, when auto-connect is enabled, opens
    /// the first broker link. Transitions to the Running state.
    pub fn initialize(mut self) -> ConnectionManager<Running> {
        info!("Initializing connection manager");

        if self.auto_connect {
            let endpoint = self.endpoint.clone();
            let options = self.options.clone();
            self.open_link(endpoint, options);
        } else {
            self.push_status();
        }

        self.transition()
    }
}

impl ConnectionManager<Running> {
    /// Main loop: reacts to caller commands and transport events until the
    /// command channel closes, then tears the link down.
    pub async fn run(mut self) {
        info!("Connection manager running");

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                signal = self.signals_rx.recv() => {
                    if let Some(signal) = signal {
                        self.handle_signal(signal);
                    }
                }
            }
        }

        debug!("Command channel closed, shutting down connection manager");
        self.teardown_link();
        self.set_state(ConnectionState::Disconnected);
    }

    fn handle_command(&mut self, command: LinkCommand) {
        match command {
            LinkCommand::Connect { endpoint, options } => self.open_link(endpoint, options),
            LinkCommand::Disconnect => {
                debug!("Explicit disconnect requested");
                self.teardown_link();
                self.set_state(ConnectionState::Disconnected);
            }
            LinkCommand::Publish {
                topic,
                payload,
                options,
            } => self.publish_message(topic, payload, options),
            LinkCommand::Subscribe {
                topic,
                qos,
                response_tx,
            } => self.subscribe_topic(topic, qos, response_tx),
            LinkCommand::Unsubscribe { topic, response_tx } => {
                self.unsubscribe_topic(topic, response_tx)
            }
            LinkCommand::ReplaceHandlers { registry } => {
                debug!("Replacing handler registry: {:?}", registry);
                self.registry = registry;
            }
        }
    }

    fn handle_signal(&mut self, signal: LinkSignal) {
        if self.link.is_none() || signal.serial != self.link_serial {
            debug!(
                "Ignoring event from superseded link (serial {}): {:?}",
                signal.serial, signal.event
            );
            return;
        }

        match signal.event {
            LinkEvent::ConnectAck => {
                info!("Broker acknowledged connection");
                self.status.state = ConnectionState::Connected;
                self.status.last_error = None;
                self.push_status();
            }
            LinkEvent::Reconnecting => {
                self.set_state(ConnectionState::Reconnecting);
            }
            LinkEvent::Closed => {
                info!("Transport connection closed");
                self.teardown_link();
                self.set_state(ConnectionState::Disconnected);
            }
            LinkEvent::Offline => {
                warn!("Transport gave up reconnecting");
                self.teardown_link();
                self.set_state(ConnectionState::Offline);
            }
            LinkEvent::Fault(fault) => {
                self.record_error(ConnectionError::Transport(fault));
                self.set_state(ConnectionState::Error);
            }
            LinkEvent::SubscribeAck(grants) => self.resolve_subscribe(grants),
            LinkEvent::UnsubscribeAck => self.resolve_unsubscribe(),
            LinkEvent::Inbound(message) => self.dispatch_inbound(message),
        }
    }

    fn publish_message(&mut self, topic: String, payload: Vec<u8>, options: PublishOptions) {
        if self.status.state != ConnectionState::Connected {
            warn!("Cannot publish to {}: link is {}", topic, self.status.state);
            self.record_error(ConnectionError::NotConnected(format!(
                "cannot publish to {}",
                topic
            )));
            return;
        }

        let result = match self.link.as_mut() {
            Some(link) => link.request_publish(&topic, payload, options.qos, options.retain),
            None => Err(ConnectionError::NotConnected(format!(
                "cannot publish to {}",
                topic
            ))),
        };

        match result {
            Ok(()) => {
                self.status.messages_sent += 1;
                self.status.last_activity = Some(Local::now());
                self.push_status();
            }
            Err(e) => {
                error!("Publish to {} failed: {}", topic, e);
                self.record_error(e);
            }
        }
    }

    fn subscribe_topic(
        &mut self,
        topic: String,
        qos: QoS,
        response_tx: oneshot::Sender<Result<SubscribeGrant, ConnectionError>>,
    ) {
        if self.status.state != ConnectionState::Connected {
            let err = ConnectionError::NotConnected(format!("cannot subscribe to {}", topic));
            warn!("{}", err);
            self.record_error(err.clone());
            let _ = response_tx.send(Err(err));
            return;
        }

        let result = match self.link.as_mut() {
            Some(link) => link.request_subscribe(&topic, qos),
            None => Err(ConnectionError::NotConnected(format!(
                "cannot subscribe to {}",
                topic
            ))),
        };

        match result {
            Ok(()) => {
                debug!("Subscribe request for {} enqueued", topic);
                self.pending_subscribes.push_back(PendingSubscribe {
                    topic,
                    response_tx,
                });
            }
            Err(e) => {
                error!("Subscribe to {} failed: {}", topic, e);
                self.record_error(e.clone());
                let _ = response_tx.send(Err(e));
            }
        }
    }

    fn unsubscribe_topic(
        &mut self,
        topic: String,
        response_tx: oneshot::Sender<Result<(), ConnectionError>>,
    ) {
        if self.status.state != ConnectionState::Connected {
            let err = ConnectionError::NotConnected(format!("cannot unsubscribe from {}", topic));
            warn!("{}", err);
            self.record_error(err.clone());
            let _ = response_tx.send(Err(err));
            return;
        }

        let result = match self.link.as_mut() {
            Some(link) => link.request_unsubscribe(&topic),
            None => Err(ConnectionError::NotConnected(format!(
                "cannot unsubscribe from {}",
                topic
            ))),
        };

        match result {
            Ok(()) => {
                debug!("Unsubscribe request for {} enqueued", topic);
                self.pending_unsubscribes.push_back(PendingUnsubscribe {
                    topic,
                    response_tx,
                });
            }
            Err(e) => {
                error!("Unsubscribe from {} failed: {}", topic, e);
                self.record_error(e.clone());
                let _ = response_tx.send(Err(e));
            }
        }
    }

    fn resolve_subscribe(&mut self, grants: Vec<Option<QoS>>) {
        let Some(pending) = self.pending_subscribes.pop_front() else {
            warn!("Subscribe acknowledgement without a pending request");
            return;
        };

        match grants.first().copied().flatten() {
            Some(qos) => {
                info!("Subscribed to {} at {:?}", pending.topic, qos);
                let _ = pending.response_tx.send(Ok(SubscribeGrant {
                    topic: pending.topic,
                    qos,
                }));
            }
            None => {
                let err = ConnectionError::Operation(format!(
                    "broker rejected subscription to {}",
                    pending.topic
                ));
                warn!("{}", err);
                self.record_error(err.clone());
                let _ = pending.response_tx.send(Err(err));
            }
        }
    }

    fn resolve_unsubscribe(&mut self) {
        let Some(pending) = self.pending_unsubscribes.pop_front() else {
            warn!("Unsubscribe acknowledgement without a pending request");
            return;
        };

        info!("Unsubscribed from {}", pending.topic);
        let _ = pending.response_tx.send(Ok(()));
    }

    /// One inbound message per delivered packet: catch-all handler first,
    /// then exact-topic handlers in registration order.
    fn dispatch_inbound(&mut self, message: InboundMessage) {
        debug!("Inbound message on {}", message.topic);
        self.status.messages_received += 1;
        self.status.last_activity = Some(message.received_at);
        self.push_status();

        self.registry.dispatch(&message);
    }
}
