//! Persistent command connection.
//!
//! This module provides the connection state machine and the pieces it is
//! built from.
//!
//! # Components
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Connection`] | State machine, request path, reconnect orchestration |
//! | [`ConnectionBuilder`] | Fluent configuration builder |
//! | [`ConnectionOptions`] | Timeouts, heartbeat, reconnect policy, flavor presets |
//! | [`RequestRegistry`] | Request id allocation and response correlation |
//! | [`HeartbeatMonitor`] | Liveness probing |
//! | [`NotificationDispatcher`] | Push delivery with pause buffering |
//! | [`SessionHandshake`] | `session/open` handshake and credential |
//!
//! # Example
//!
//! ```no_run
//! use command_link::{CommandKind, Connection, ConnectionOptions, Operation, Result, SessionHandshake};
//!
//! # async fn example() -> Result<()> {
//! let connection = Connection::builder()
//!     .endpoint("wss://rtm.example.com/")
//!     .options(ConnectionOptions::game())
//!     .handshake(SessionHandshake::new("app-id", "alice"))
//!     .build()?;
//!
//! connection.connect().await?;
//! connection
//!     .send_request(CommandKind::Conv, Operation::Start, serde_json::json!({"m": ["bob"]}))
//!     .await?;
//! connection.close().await?;
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Submodules
// ============================================================================

/// Fluent builder pattern for connection configuration.
pub mod builder;

/// Core connection implementation.
pub mod core;

/// Notification delivery with pause buffering.
pub mod dispatcher;

/// Liveness probing.
pub mod heartbeat;

/// Connection options and flavor presets.
pub mod options;

/// Outstanding request tracking.
pub mod registry;

/// Session-open handshake.
pub mod session;

/// Connection state and lifecycle signals.
pub mod state;

// ============================================================================
// Re-exports
// ============================================================================

pub use builder::ConnectionBuilder;
pub use core::Connection;
pub use dispatcher::{NotificationDispatcher, NotificationHandler};
pub use heartbeat::{HeartbeatMonitor, HeartbeatOptions};
pub use options::{ConnectionOptions, ReconnectPolicy};
pub use registry::{RequestRegistry, ResponseReceiver};
pub use session::{Handshake, HandshakeOutcome, SessionCredential, SessionHandshake};
pub use state::{
    CLOSE_BY_SERVER, CLOSE_GOAWAY, CLOSE_HEARTBEAT_TIMEOUT, ConnectionEvent, ConnectionState,
    EventHandler, OpenOutcome,
};
