//! Connection configuration.
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use command_link::{ConnectionOptions, ReconnectPolicy};
//!
//! let options = ConnectionOptions::game()
//!     .with_send_timeout(Duration::from_secs(5))
//!     .with_reconnect(ReconnectPolicy::attempts(3, Duration::from_secs(2)));
//! ```
//!
//! # Presets
//!
//! | Preset | Heartbeat | Misses | Any frame resets | Close command | Reconnect |
//! |--------|-----------|--------|------------------|---------------|-----------|
//! | `game()` | 5s | 1 | no | `conn/close` | off |
//! | `lobby()` | 20s | 1 | no | `conn/close` | off |
//! | `realtime()` | 180s | 2 | yes | none | 10 × 10s |

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use crate::protocol::{CommandKind, Operation};

use super::heartbeat::HeartbeatOptions;

// ============================================================================
// Constants
// ============================================================================

/// Send-phase timeout.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for the session-open handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum pending requests before rejecting new ones.
pub const DEFAULT_MAX_PENDING: usize = 100;

// ============================================================================
// ReconnectPolicy
// ============================================================================

/// Automatic reconnection after a transport loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Reconnect automatically.
    pub enabled: bool,
    /// Attempts before giving up (`None` retries forever).
    pub max_attempts: Option<u32>,
    /// Delay between attempts.
    pub interval: Duration,
}

impl ReconnectPolicy {
    /// No automatic reconnection.
    #[inline]
    #[must_use]
    pub const fn disabled() -> Self {
        Self {
            enabled: false,
            max_attempts: None,
            interval: Duration::ZERO,
        }
    }

    /// Reconnect up to `max_attempts` times, `interval` apart.
    #[inline]
    #[must_use]
    pub const fn attempts(max_attempts: u32, interval: Duration) -> Self {
        Self {
            enabled: true,
            max_attempts: Some(max_attempts),
            interval,
        }
    }

    /// Reconnect until closed, `interval` apart.
    #[inline]
    #[must_use]
    pub const fn forever(interval: Duration) -> Self {
        Self {
            enabled: true,
            max_attempts: None,
            interval,
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::disabled()
    }
}

// ============================================================================
// ConnectionOptions
// ============================================================================

/// Tunables of a [`Connection`](super::Connection).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionOptions {
    /// Time allowed for the transport to accept one frame.
    pub send_timeout: Duration,

    /// Time allowed for the session-open exchange.
    pub handshake_timeout: Duration,

    /// Liveness probing.
    pub heartbeat: HeartbeatOptions,

    /// Automatic reconnection.
    pub reconnect: ReconnectPolicy,

    /// Command sent before a graceful close, if the protocol has one.
    pub close_command: Option<(CommandKind, Operation)>,

    /// Maximum outstanding requests.
    pub max_pending: usize,

    /// Join identical in-flight idempotent requests instead of resending.
    pub coalesce_duplicates: bool,
}

// ============================================================================
// Constructors
// ============================================================================

impl ConnectionOptions {
    /// Creates options with default settings.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self {
            send_timeout: DEFAULT_SEND_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            heartbeat: HeartbeatOptions::new(),
            reconnect: ReconnectPolicy::disabled(),
            close_command: None,
            max_pending: DEFAULT_MAX_PENDING,
            coalesce_duplicates: false,
        }
    }

    /// Latency-sensitive game session.
    #[must_use]
    pub fn game() -> Self {
        Self::new()
            .with_heartbeat(HeartbeatOptions::every(Duration::from_secs(5)))
            .with_close_command(CommandKind::Conn, Operation::Close)
    }

    /// Lobby / idle connection.
    #[must_use]
    pub fn lobby() -> Self {
        Self::new()
            .with_heartbeat(HeartbeatOptions::every(Duration::from_secs(20)))
            .with_close_command(CommandKind::Conn, Operation::Close)
    }

    /// Long-lived messaging connection.
    #[must_use]
    pub fn realtime() -> Self {
        Self::new()
            .with_heartbeat(
                HeartbeatOptions::every(Duration::from_secs(180))
                    .with_max_missed(2)
                    .with_reset_on_any_frame(),
            )
            .with_reconnect(ReconnectPolicy::attempts(10, Duration::from_secs(10)))
            .with_coalescing()
    }
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Builder Methods
// ============================================================================

impl ConnectionOptions {
    /// Sets the send-phase timeout.
    #[inline]
    #[must_use]
    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    /// Sets the handshake timeout.
    #[inline]
    #[must_use]
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Sets heartbeat options.
    #[inline]
    #[must_use]
    pub fn with_heartbeat(mut self, heartbeat: HeartbeatOptions) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    /// Disables the heartbeat.
    #[inline]
    #[must_use]
    pub fn without_heartbeat(mut self) -> Self {
        self.heartbeat = HeartbeatOptions::disabled();
        self
    }

    /// Sets the reconnection policy.
    #[inline]
    #[must_use]
    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Sets the command sent before a graceful close.
    #[inline]
    #[must_use]
    pub fn with_close_command(mut self, kind: CommandKind, op: Operation) -> Self {
        self.close_command = Some((kind, op));
        self
    }

    /// Sets the maximum number of outstanding requests.
    #[inline]
    #[must_use]
    pub fn with_max_pending(mut self, max_pending: usize) -> Self {
        self.max_pending = max_pending;
        self
    }

    /// Enables coalescing of identical idempotent requests.
    #[inline]
    #[must_use]
    pub fn with_coalescing(mut self) -> Self {
        self.coalesce_duplicates = true;
        self
    }
}

// ============================================================================
// Tests
// ============================================================================
