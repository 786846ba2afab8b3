//! Inbound message representation and handler fan-out.
//!
//! One [`InboundMessage`] is built per delivered broker packet and handed to
//! the [`HandlerRegistry`], which calls the catch-all handler first and then
//! every handler registered for the exact topic, in registration order.

use std::fmt;

use chrono::{DateTime, Local};
pub use rumqttc::QoS;

/// Raw packet metadata carried alongside an inbound message.
///
/// Kept opaque to the dispatch logic; handlers that care about delivery
/// details (duplicate flag, retained messages) can inspect it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PacketMeta {
    pub qos: QoS,
    pub retain: bool,
    pub dup: bool,
    pub packet_id: u16,
}

impl Default for PacketMeta {
    fn default() -> Self {
        Self {
            qos: QoS::AtMostOnce,
            retain: false,
            dup: false,
            packet_id: 0,
        }
    }
}

/// A single message delivered by the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub received_at: DateTime<Local>,
    pub meta: PacketMeta,
}

impl InboundMessage {
    pub fn new(topic: String, payload: Vec<u8>, meta: PacketMeta) -> Self {
        Self {
            topic,
            payload,
            received_at: Local::now(),
            meta,
        }
    }

    /// Payload as UTF-8 text, with invalid bytes replaced.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    pub fn render(&self) -> String {
        format!("{}: {}\n{}", self.received_at, self.topic, self.text())
    }
}

impl fmt::Display for InboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} - {}", self.topic, self.text())
    }
}

/// Callback invoked for matching inbound messages.
pub type MessageHandler = Box<dyn Fn(&InboundMessage) + Send>;

/// Mapping from topic to ordered handlers, plus one optional catch-all.
///
/// Topic matching is direct string equality; wildcard filters (`+`, `#`) are
/// not expanded, so a broker-side wildcard subscription will not be matched
/// locally. Handler panics are not caught and abort the dispatching task.
#[derive(Default)]
pub struct HandlerRegistry {
    catch_all: Option<MessageHandler>,
    topic_handlers: Vec<(String, MessageHandler)>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs the catch-all handler, invoked for every message regardless
    /// of topic, before any topic handlers.
    pub fn on_any(mut self, handler: MessageHandler) -> Self {
        self.catch_all = Some(handler);
        self
    }

    /// Appends a handler for an exact topic. Multiple handlers per topic are
    /// allowed and run in registration order.
    pub fn on_topic(mut self, topic: impl Into<String>, handler: MessageHandler) -> Self {
        self.topic_handlers.push((topic.into(), handler));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.catch_all.is_none() && self.topic_handlers.is_empty()
    }

    pub(crate) fn dispatch(&self, message: &InboundMessage) {
        if let Some(handler) = &self.catch_all {
            handler(message);
        }

        for (topic, handler) in &self.topic_handlers {
            if topic == &message.topic {
                handler(message);
            }
        }
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("catch_all", &self.catch_all.is_some())
            .field("topics", &self.topic_handlers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn message(topic: &str) -> InboundMessage {
        InboundMessage::new(topic.to_string(), b"hi".to_vec(), PacketMeta::default())
    }

    fn recording_handler(log: Arc<Mutex<Vec<String>>>, tag: &str) -> MessageHandler {
        let tag = tag.to_string();
        Box::new(move |_msg| log.lock().unwrap().push(tag.clone()))
    }

    #[test]
    fn exact_topic_match_invokes_handler_once() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry =
            HandlerRegistry::new().on_topic("chat/room1", recording_handler(log.clone(), "room1"));

        registry.dispatch(&message("chat/room1"));
        assert_eq!(log.lock().unwrap().as_slice(), ["room1"]);

        registry.dispatch(&message("chat/room2"));
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[test]
    fn catch_all_runs_first_then_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = HandlerRegistry::new()
            .on_topic("chat/room1", recording_handler(log.clone(), "first"))
            .on_topic("chat/room1", recording_handler(log.clone(), "second"))
            .on_any(recording_handler(log.clone(), "any"));

        registry.dispatch(&message("chat/room1"));
        assert_eq!(log.lock().unwrap().as_slice(), ["any", "first", "second"]);
    }

    #[test]
    fn wildcard_filters_are_not_expanded() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry =
            HandlerRegistry::new().on_topic("chat/+", recording_handler(log.clone(), "wildcard"));

        registry.dispatch(&message("chat/room1"));
        assert!(log.lock().unwrap().is_empty());
    }
}
