//! # Connection Lifecycle Module
//!
//! Owns chatlink's single broker connection: a state-machine-driven manager
//! that opens, supervises, and replaces one MQTT link at a time, exposes
//! publish/subscribe/unsubscribe gated on connection state, and fans inbound
//! messages out to the registered handlers.
//!
//! ## Why This Module Exists
//!
//! Everything interesting in a thin MQTT chat client is connection lifecycle:
//! knowing which of the six states the link is in, making sure a superseded
//! connection can never mutate current state, and failing operations fast
//! with a recorded error instead of blocking on a dead socket. This module
//! concentrates that logic so the UI layer only ever sees a status snapshot
//! and a handful of async operations.
//!
//! ## Module Architecture
//!
//! ```text
//! connection/
//! ├── error.rs    - Error kinds recorded as the manager's last error
//! ├── manager.rs  - State machine, link slot, command and event handling
//! └── handle.rs   - Caller-facing API over the manager task
//! ```
//!
//! ## State Machine
//!
//! ```text
//! Disconnected ──connect──► Connecting ──ack──► Connected ──drop──► Reconnecting
//!       ▲                                          │    ▲               │
//!       │◄──────── close / explicit disconnect ────┘    └──────ack──────┘
//!       │
//!       └── any state can reach Error (transport fault) and Offline
//!           (transport stopped retrying); both resolve via a new connect
//! ```
//!
//! ## Design Philosophy
//!
//! - **One writer**: all state transitions happen on the manager task in
//!   response to commands and transport events; nothing else touches status
//! - **One live link**: the link slot is torn down (pump detached, close
//!   requested) before a replacement is created, and stale events are
//!   filtered by link serial
//! - **No retries here**: reconnect policy belongs to the transport; the
//!   manager only reflects what it is told

pub mod error;
pub mod handle;
pub mod manager;

pub use error::ConnectionError;
pub use handle::{ConnectionHandle, ManagerSettings};
pub use manager::{ConnectionState, ConnectionStatus, PublishOptions};
