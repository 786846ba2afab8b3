//! Transport seam between the connection manager and the MQTT client.
//!
//! The manager never talks to rumqttc directly. It opens links through the
//! [`Transport`] trait and receives lifecycle and message events as
//! [`LinkSignal`]s on a single mpsc channel. Each opened link is tagged with a
//! serial number; the manager discards signals whose serial does not match the
//! currently-tracked link, so a superseded connection can never mutate current
//! state. Cancellation is "stop listening": [`TransportLink::shutdown`] must
//! stop the event pump before requesting the transport close.

pub mod rumqtt;

use tokio::sync::mpsc;

use crate::connection::error::ConnectionError;
use crate::message::{InboundMessage, QoS};

/// Broker grant for a single subscribe request.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscribeGrant {
    pub topic: String,
    pub qos: QoS,
}

/// Lifecycle and message events reported by a link's event pump.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// Broker acknowledged the connection handshake
    ConnectAck,
    /// The transport is retrying the connection on its own
    Reconnecting,
    /// The transport connection closed
    Closed,
    /// The transport exhausted its reconnect attempts and gave up
    Offline,
    /// Error reported by the transport; it may still keep retrying
    Fault(String),
    /// Per-topic grant results for the oldest pending subscribe request,
    /// `None` where the broker refused the filter
    SubscribeAck(Vec<Option<QoS>>),
    /// Acknowledgement for the oldest pending unsubscribe request
    UnsubscribeAck,
    /// A message delivered by the broker
    Inbound(InboundMessage),
}

/// A [`LinkEvent`] tagged with the serial of the link that produced it.
#[derive(Debug, Clone)]
pub struct LinkSignal {
    pub serial: u64,
    pub event: LinkEvent,
}

/// Per-connection options handed to the transport.
///
/// The `token` travels in the MQTT password field, the shape the broker-side
/// custom authorizer expects. Nothing in this crate verifies it; a broker
/// deployment must check the credential against its identity provider before
/// granting access.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkOptions {
    pub client_id: String,
    pub username: String,
    pub token: String,
    pub keep_alive_secs: u64,
    /// Consecutive poll failures the transport tolerates before reporting
    /// `Offline` and stopping
    pub max_reconnect_attempts: usize,
    /// Pause between reconnect attempts, in milliseconds
    pub reconnect_delay_ms: u64,
}

impl Default for LinkOptions {
    fn default() -> Self {
        Self {
            client_id: String::from("chatlink"),
            username: String::new(),
            token: String::new(),
            keep_alive_secs: 5,
            max_reconnect_attempts: 10,
            reconnect_delay_ms: 1000,
        }
    }
}

/// A live broker connection owned by the manager's link slot.
///
/// Requests enqueue transport I/O and return immediately; results arrive as
/// [`LinkSignal`]s. Implementations must detach their event pump before
/// requesting the close in [`shutdown`](TransportLink::shutdown) so that no
/// further signals are produced for a link the caller no longer wants.
pub trait TransportLink: Send {
    fn request_publish(
        &mut self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), ConnectionError>;

    fn request_subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), ConnectionError>;

    fn request_unsubscribe(&mut self, topic: &str) -> Result<(), ConnectionError>;

    /// Stops the event pump, then requests the transport close. Idempotent.
    fn shutdown(&mut self);
}

/// Factory for broker links.
pub trait Transport: Send {
    /// Opens a connection to `endpoint` and spawns its event pump. Signals
    /// produced by the new link carry `serial`.
    fn open(
        &mut self,
        endpoint: &str,
        options: &LinkOptions,
        serial: u64,
        signals: mpsc::Sender<LinkSignal>,
    ) -> Result<Box<dyn TransportLink>, ConnectionError>;
}

#[cfg(test)]
pub(crate) mod mock {
    //! Recording transport used by the manager and handle tests.

    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone, PartialEq)]
    pub enum LinkRequest {
        Publish {
            topic: String,
            payload: Vec<u8>,
            qos: QoS,
            retain: bool,
        },
        Subscribe {
            topic: String,
            qos: QoS,
        },
        Unsubscribe {
            topic: String,
        },
    }

    #[derive(Default)]
    pub struct MockState {
        pub opened_endpoints: Mutex<Vec<String>>,
        pub requests: Mutex<Vec<LinkRequest>>,
        pub shutdowns: AtomicUsize,
        /// Signal sender of the most recently opened link, for injecting
        /// transport events from tests
        pub signals: Mutex<Option<(u64, mpsc::Sender<LinkSignal>)>>,
    }

    impl MockState {
        pub fn requests(&self) -> Vec<LinkRequest> {
            self.requests.lock().unwrap().clone()
        }

        pub fn open_count(&self) -> usize {
            self.opened_endpoints.lock().unwrap().len()
        }

        pub fn shutdown_count(&self) -> usize {
            self.shutdowns.load(Ordering::SeqCst)
        }

        /// Emits an event as if the link with `serial` produced it.
        pub fn emit(&self, serial: u64, event: LinkEvent) {
            let guard = self.signals.lock().unwrap();
            let (_, sender) = guard.as_ref().expect("no link opened");
            sender
                .try_send(LinkSignal { serial, event })
                .expect("signal channel full");
        }

        /// Emits an event tagged with the serial of the latest opened link.
        pub fn emit_current(&self, event: LinkEvent) {
            let serial = self.signals.lock().unwrap().as_ref().expect("no link").0;
            self.emit(serial, event);
        }

        pub fn current_serial(&self) -> u64 {
            self.signals.lock().unwrap().as_ref().expect("no link").0
        }
    }

    pub struct MockTransport {
        pub state: Arc<MockState>,
        pub fail_open: bool,
    }

    impl MockTransport {
        pub fn new() -> (Self, Arc<MockState>) {
            let state = Arc::new(MockState::default());
            (
                Self {
                    state: state.clone(),
                    fail_open: false,
                },
                state,
            )
        }
    }

    impl Transport for MockTransport {
        fn open(
            &mut self,
            endpoint: &str,
            _options: &LinkOptions,
            serial: u64,
            signals: mpsc::Sender<LinkSignal>,
        ) -> Result<Box<dyn TransportLink>, ConnectionError> {
            if self.fail_open {
                return Err(ConnectionError::Transport(format!(
                    "failed to open {}",
                    endpoint
                )));
            }
            self.state
                .opened_endpoints
                .lock()
                .unwrap()
                .push(endpoint.to_string());
            *self.state.signals.lock().unwrap() = Some((serial, signals));
            Ok(Box::new(MockLink {
                state: self.state.clone(),
            }))
        }
    }

    pub struct MockLink {
        state: Arc<MockState>,
    }

    impl TransportLink for MockLink {
        fn request_publish(
            &mut self,
            topic: &str,
            payload: Vec<u8>,
            qos: QoS,
            retain: bool,
        ) -> Result<(), ConnectionError> {
            self.state.requests.lock().unwrap().push(LinkRequest::Publish {
                topic: topic.to_string(),
                payload,
                qos,
                retain,
            });
            Ok(())
        }

        fn request_subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), ConnectionError> {
            self.state.requests.lock().unwrap().push(LinkRequest::Subscribe {
                topic: topic.to_string(),
                qos,
            });
            Ok(())
        }

        fn request_unsubscribe(&mut self, topic: &str) -> Result<(), ConnectionError> {
            self.state
                .requests
                .lock()
                .unwrap()
                .push(LinkRequest::Unsubscribe {
                    topic: topic.to_string(),
                });
            Ok(())
        }

        fn shutdown(&mut self) {
            self.state.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }
}
