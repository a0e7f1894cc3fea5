//! Error types for the command connection.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use command_link::{CommandKind, Operation, Result};
//!
//! async fn example(connection: &Connection) -> Result<()> {
//!     connection.connect().await?;
//!     let reply = connection
//!         .send_request(CommandKind::Conv, Operation::Query, serde_json::json!({}))
//!         .await?;
//!     Ok(())
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Configuration | [`Error::Config`] |
//! | Connection | [`Error::Connection`], [`Error::ConnectionTimeout`], [`Error::ConnectionClosed`], [`Error::ConnectionReset`], [`Error::InvalidState`] |
//! | Session | [`Error::SessionRejected`] |
//! | Protocol | [`Error::Protocol`] |
//! | Exchange | [`Error::Server`], [`Error::RequestTimeout`], [`Error::SendTimeout`] |
//! | External | [`Error::Json`], [`Error::WebSocket`] |
//!
//! [`Error`] is `Clone`: one connect outcome is shared by every caller that
//! joined the in-flight attempt, and one response by every coalesced request.

// ============================================================================
// Imports
// ============================================================================

use std::result::Result as StdResult;
use std::sync::Arc;

use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;

use crate::connection::ConnectionState;
use crate::identifiers::RequestId;

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
///
/// All fallible operations in this crate return this type.
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
///
/// Each variant includes relevant context for debugging.
#[derive(Error, Debug, Clone)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration error.
    ///
    /// Returned when connection configuration is invalid.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    // ========================================================================
    // Connection Errors
    // ========================================================================
    /// Transport connection failed.
    ///
    /// Returned when no endpoint accepted the transport connection.
    #[error("Connection failed: {message}")]
    Connection {
        /// Description of the connection error.
        message: String,
    },

    /// Timeout waiting for the session-open handshake.
    #[error("Connection timeout after {timeout_ms}ms")]
    ConnectionTimeout {
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    /// The connection is closed.
    ///
    /// Returned when sending on a closed connection, or when a connect
    /// attempt was interrupted by `close()`.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The transport went away while the request was outstanding.
    ///
    /// No request survives a transport replacement; the caller must retry.
    #[error("Connection reset")]
    ConnectionReset,

    /// Operation not permitted in the current connection state.
    #[error("Cannot {operation} while {state}")]
    InvalidState {
        /// The rejected operation.
        operation: &'static str,
        /// State the connection was in.
        state: ConnectionState,
    },

    // ========================================================================
    // Session Errors
    // ========================================================================
    /// The server refused to open the session.
    #[error("Session rejected ({code}): {reason}")]
    SessionRejected {
        /// Server-provided code.
        code: i32,
        /// Server-provided reason.
        reason: String,
    },

    // ========================================================================
    // Protocol Errors
    // ========================================================================
    /// Protocol violation or unexpected message.
    #[error("Protocol error: {message}")]
    Protocol {
        /// Description of the protocol violation.
        message: String,
    },

    // ========================================================================
    // Exchange Errors
    // ========================================================================
    /// The server answered the request with an error.
    #[error("Server error {code}: {detail}")]
    Server {
        /// Server-provided error code.
        code: i32,
        /// Server-provided detail.
        detail: String,
        /// Application-level code, when the server provides one.
        app_code: Option<i32>,
        /// Application-level message, when the server provides one.
        app_message: Option<String>,
    },

    /// The request frame was not handed to the transport in time.
    #[error("Request {request_id} timed out after {timeout_ms}ms")]
    RequestTimeout {
        /// The request ID that timed out.
        request_id: RequestId,
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    /// A fire-and-forget command was not handed to the transport in time.
    #[error("Send timed out after {timeout_ms}ms")]
    SendTimeout {
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    // ========================================================================
    // External Errors
    // ========================================================================
    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(Arc<serde_json::Error>),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(Arc<WsError>),
}

// ============================================================================
// Conversions
// ============================================================================

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(Arc::new(err))
    }
}

impl From<WsError> for Error {
    fn from(err: WsError) -> Self {
        Self::WebSocket(Arc::new(err))
    }
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a connection error.
    #[inline]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Creates a connection timeout error.
    #[inline]
    pub fn connection_timeout(timeout_ms: u64) -> Self {
        Self::ConnectionTimeout { timeout_ms }
    }

    /// Creates an invalid state error.
    #[inline]
    pub fn invalid_state(operation: &'static str, state: ConnectionState) -> Self {
        Self::InvalidState { operation, state }
    }

    /// Creates a session rejected error.
    #[inline]
    pub fn session_rejected(code: i32, reason: impl Into<String>) -> Self {
        Self::SessionRejected {
            code,
            reason: reason.into(),
        }
    }

    /// Creates a protocol error.
    #[inline]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Creates a server error with code and detail only.
    #[inline]
    pub fn server(code: i32, detail: impl Into<String>) -> Self {
        Self::Server {
            code,
            detail: detail.into(),
            app_code: None,
            app_message: None,
        }
    }

    /// Creates a request timeout error.
    #[inline]
    pub fn request_timeout(request_id: RequestId, timeout_ms: u64) -> Self {
        Self::RequestTimeout {
            request_id,
            timeout_ms,
        }
    }

    /// Creates a send timeout error.
    #[inline]
    pub fn send_timeout(timeout_ms: u64) -> Self {
        Self::SendTimeout { timeout_ms }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if this is a timeout error.
    #[inline]
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::ConnectionTimeout { .. } | Self::RequestTimeout { .. } | Self::SendTimeout { .. }
        )
    }

    /// Returns `true` if this is a connection error.
    #[inline]
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. }
                | Self::ConnectionTimeout { .. }
                | Self::ConnectionClosed
                | Self::ConnectionReset
                | Self::WebSocket(_)
        )
    }

    /// Returns `true` if the server reported this error.
    #[inline]
    #[must_use]
    pub fn is_server_error(&self) -> bool {
        matches!(self, Self::Server { .. } | Self::SessionRejected { .. })
    }

    /// Returns `true` if this error is recoverable.
    ///
    /// Recoverable errors may succeed on retry, possibly after reconnecting.
    #[inline]
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionTimeout { .. }
                | Self::ConnectionReset
                | Self::RequestTimeout { .. }
                | Self::SendTimeout { .. }
        )
    }
}

// ============================================================================
// Tests
// ============================================================================
