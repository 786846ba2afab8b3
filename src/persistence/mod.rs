//! # Persistence Module
//!
//! ## Why This Module Exists
//! Holds the configuration data model and the portal that loads and saves it
//! as TOML under the user's home directory. The demo binary reads one profile
//! (broker endpoint, credentials, chat room, link tuning) at startup; the
//! manager itself never touches the filesystem.
//!
//! ## Design Philosophy
//! Fail-safe: a missing or unreadable configuration file degrades to defaults
//! instead of preventing startup, and every section carries serde defaults so
//! partially written files still load. Message history is deliberately not
//! persisted.

pub mod config_portal;

use serde::{Deserialize, Serialize};

use crate::message::QoS;
use crate::transport::LinkOptions;

/// Broker profile for the demo chat client.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct BrokerSettings {
    /// Broker endpoint as `host:port`
    pub url: String,
    /// Username for MQTT authentication
    pub user: String,
    /// Credential forwarded in the MQTT password field. The broker-side
    /// authorizer is expected to verify it; this client does not.
    pub token: String,
    /// Client identifier presented to the broker
    pub client_id: String,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            url: String::from("localhost:1883"),
            user: String::new(),
            token: String::new(),
            client_id: String::from("chatlink"),
        }
    }
}

/// Chat-facing settings for the demo binary.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ChatSettings {
    /// Name prefixed to outgoing messages
    pub display_name: String,
    /// Room topic to subscribe and publish to
    pub room: String,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            display_name: String::from("anonymous"),
            room: String::from("chat/room1"),
        }
    }
}

/// Link supervision tuning handed to the transport.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct LinkSettings {
    pub keep_alive_secs: u64,
    pub auto_connect: bool,
    /// QoS level for the room subscription (0, 1 or 2)
    pub subscribe_qos: u8,
    pub max_reconnect_attempts: usize,
    pub reconnect_delay_ms: u64,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            keep_alive_secs: 5,
            auto_connect: true,
            subscribe_qos: 0,
            max_reconnect_attempts: 10,
            reconnect_delay_ms: 1000,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub broker: BrokerSettings,
    pub chat: ChatSettings,
    pub link: LinkSettings,
}

impl AppConfig {
    pub fn link_options(&self) -> LinkOptions {
        LinkOptions {
            client_id: self.broker.client_id.clone(),
            username: self.broker.user.clone(),
            token: self.broker.token.clone(),
            keep_alive_secs: self.link.keep_alive_secs,
            max_reconnect_attempts: self.link.max_reconnect_attempts,
            reconnect_delay_ms: self.link.reconnect_delay_ms,
        }
    }

    pub fn subscribe_qos(&self) -> QoS {
        match self.link.subscribe_qos {
            2 => QoS::ExactlyOnce,
            1 => QoS::AtLeastOnce,
            _ => QoS::AtMostOnce,
        }
    }
}
