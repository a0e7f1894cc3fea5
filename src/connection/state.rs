//! Connection state and lifecycle signals.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

// ============================================================================
// Close Codes
// ============================================================================

/// Close code reported when the heartbeat deadline passed.
pub const CLOSE_HEARTBEAT_TIMEOUT: u16 = 4900;

/// Close code reported when the server sent `goaway`.
pub const CLOSE_GOAWAY: u16 = 4901;

/// Close code reported when the server sent `conn/closed`.
pub const CLOSE_BY_SERVER: u16 = 4902;

// ============================================================================
// ConnectionState
// ============================================================================

/// Lifecycle state of a [`Connection`](super::Connection).
///
/// ```text
/// Idle ──connect──► Connecting ──handshake ok──► Open ◄──resume── Paused
///                       │                          │  ──pause───►   │
///                       ▼                          ▼                ▼
///                     Closed ◄──────────── close / loss / heartbeat ┘
///                       │
///                       └──connect / reopen──► Connecting
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Never connected.
    Idle,
    /// Transport or handshake in progress.
    Connecting,
    /// Session open, notifications delivered live.
    Open,
    /// Session open, notifications buffered.
    Paused,
    /// No live transport.
    Closed,
}

impl ConnectionState {
    /// Returns `true` if requests may be sent.
    #[inline]
    #[must_use]
    pub const fn is_live(self) -> bool {
        matches!(self, Self::Open | Self::Paused)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Paused => "paused",
            Self::Closed => "closed",
        })
    }
}

// ============================================================================
// ConnectionEvent
// ============================================================================

/// Connection-wide signal for the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The live transport was lost or force-closed.
    ///
    /// Fired once per loss. Outstanding requests have already failed with
    /// [`Error::ConnectionReset`](crate::Error::ConnectionReset).
    Disconnected {
        /// Close code.
        code: u16,
        /// Close reason.
        reason: String,
    },

    /// Automatic reconnection is about to try again.
    Reconnecting {
        /// 1-based attempt number.
        attempt: u32,
    },

    /// Automatic reconnection gave up.
    ReconnectFailed {
        /// Attempts made.
        attempts: u32,
    },

    /// A reopen handshake reattached to the previous server-side session.
    Resumed,

    /// The transport is back but the server-side session is gone.
    ///
    /// The application must re-authenticate or discard cached state.
    SessionClosed {
        /// Server-provided code.
        code: i32,
        /// Server-provided reason.
        reason: String,
    },
}

/// Event handler callback type.
pub type EventHandler = Arc<dyn Fn(ConnectionEvent) + Send + Sync>;

// ============================================================================
// OpenOutcome
// ============================================================================

/// Result of a successful connect or reopen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenOutcome {
    /// The connection was already open; nothing was sent.
    AlreadyOpen,
    /// A fresh session was opened.
    Opened,
    /// The previous session was resumed.
    Resumed,
    /// The transport is open but the previous session was rejected.
    SessionLost {
        /// Server-provided code.
        code: i32,
        /// Server-provided reason.
        reason: String,
    },
}

// ============================================================================
// Tests
// ============================================================================
