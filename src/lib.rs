//! Command Link - Persistent multiplexed command connection.
//!
//! This library keeps one long-lived, bidirectional connection to a
//! realtime backend and multiplexes request/response exchanges and
//! server-pushed notifications over it.
//!
//! # Architecture
//!
//! The connection follows a client-server model:
//!
//! - **Local End (Rust)**: Sends requests and commands, receives responses
//!   and notifications over a pluggable transport
//! - **Remote End (Backend)**: Answers requests by id, pushes notifications,
//!   answers heartbeat probes
//!
//! Key design principles:
//!
//! - Each [`Connection`] owns: state machine + request registry + heartbeat
//!   + notification queue; transports come and go underneath it
//! - Protocol uses `cmd` / `op` pairs with an optional request id `i`
//! - Responses may arrive in any order; notifications are delivered in
//!   strict arrival order, across pause and resume
//! - Every outstanding request completes exactly once
//!
//! # Quick Start
//!
//! ```no_run
//! use command_link::{CommandKind, Connection, ConnectionOptions, Operation, Result, SessionHandshake};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let connection = Connection::builder()
//!         .endpoint("wss://rtm.example.com/")
//!         .options(ConnectionOptions::realtime())
//!         .handshake(SessionHandshake::new("app-id", "alice"))
//!         .build()?;
//!
//!     connection.set_notification_handler(|command| println!("push: {command}"));
//!     connection.set_event_handler(|event| println!("event: {event:?}"));
//!
//!     connection.connect().await?;
//!
//!     let reply = connection
//!         .send_request(CommandKind::Conv, Operation::Query, serde_json::json!({"limit": 10}))
//!         .await?;
//!     println!("reply: {reply}");
//!
//!     connection.close().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`connection`] | [`Connection`], builder, options, heartbeat, dispatcher, session |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`identifiers`] | Type-safe ID wrappers |
//! | [`protocol`] | Command envelope, codec, inbound routing |
//! | [`transport`] | Transport traits, WebSocket and in-memory transports |

// ============================================================================
// Modules
// ============================================================================

/// Connection state machine and its components.
///
/// Use [`Connection::builder()`] to create a configured connection.
pub mod connection;

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Type-safe identifiers.
///
/// Newtype wrappers prevent mixing incompatible IDs at compile time.
pub mod identifiers;

/// Wire protocol types.
///
/// Command envelope, frame codec and inbound classification.
pub mod protocol;

/// Transport layer.
///
/// Frame transports the connection runs on.
pub mod transport;

// ============================================================================
// Re-exports
// ============================================================================

// Connection types
pub use connection::{
    Connection, ConnectionBuilder, ConnectionEvent, ConnectionOptions, ConnectionState,
    Handshake, HandshakeOutcome, HeartbeatOptions, OpenOutcome, ReconnectPolicy,
    SessionCredential, SessionHandshake,
};

// Error types
pub use error::{Error, Result};

// Identifier types
pub use identifiers::{ConnectionId, RequestId};

// Protocol types
pub use protocol::{Command, CommandKind, ErrorInfo, FrameCodec, JsonCodec, Operation};

// Transport types
pub use transport::{Connector, TransportEvent, TransportLink, WebSocketConnector};
