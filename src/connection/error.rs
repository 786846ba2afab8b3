//! Fehlerdefinitionen für das Verbindungs-Modul

use thiserror::Error;

/// Error kinds surfaced by the connection manager.
///
/// Every error is also recorded as the manager's last error and published
/// through the status channel, so callers that fire-and-forget can still
/// observe failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectionError {
    /// Missing or invalid broker endpoint or options
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Operation attempted while the manager is not in the Connected state
    #[error("Not connected: {0}")]
    NotConnected(String),

    /// Failure reported by the underlying MQTT client
    #[error("Transport error: {0}")]
    Transport(String),

    /// The broker rejected a specific publish/subscribe/unsubscribe request
    #[error("Operation rejected: {0}")]
    Operation(String),

    /// Communication with the manager task failed
    #[error("Channel error: {0}")]
    Channel(String),
}
