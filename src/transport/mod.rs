//! Transport layer.
//!
//! A transport is an ordered, reliable frame stream. The connection opens a
//! new one on every connect cycle through a [`Connector`] and splits it into
//! a [`FrameSink`] (driven by the writer task) and a [`FrameSource`]
//! (driven by the reader task).
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────┐                         ┌──────────────────┐
//! │  Connection          │                         │  Backend         │
//! │                      │      frames (bytes)     │                  │
//! │  writer → FrameSink  │────────────────────────►│                  │
//! │  reader ← FrameSource│◄────────────────────────│                  │
//! └──────────────────────┘                         └──────────────────┘
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `websocket` | WebSocket client transport |
//! | `memory` | In-process transport for tests and benches |

// ============================================================================
// Imports
// ============================================================================

use async_trait::async_trait;

use crate::error::Result;

// ============================================================================
// Submodules
// ============================================================================

/// In-process transport.
pub mod memory;

/// WebSocket client transport.
pub mod websocket;

// ============================================================================
// Re-exports
// ============================================================================

pub use memory::{MemoryAcceptor, MemoryConnector, MemoryPeer};
pub use websocket::WebSocketConnector;

// ============================================================================
// Constants
// ============================================================================

/// Close code reported when a stream ends without a close handshake.
pub const CLOSE_ABNORMAL: u16 = 1006;

// ============================================================================
// TransportEvent
// ============================================================================

/// Inbound event from a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// One complete frame.
    Frame(Vec<u8>),
    /// The transport is gone. No further events follow.
    Closed {
        /// Close code.
        code: u16,
        /// Close reason.
        reason: String,
    },
}

impl TransportEvent {
    /// Creates a close event.
    #[inline]
    #[must_use]
    pub fn closed(code: u16, reason: impl Into<String>) -> Self {
        Self::Closed {
            code,
            reason: reason.into(),
        }
    }
}

// ============================================================================
// Traits
// ============================================================================

/// Outbound half of a transport.
#[async_trait]
pub trait FrameSink: Send + 'static {
    /// Sends one frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport is not open or the write fails.
    async fn send(&mut self, frame: Vec<u8>) -> Result<()>;

    /// Closes the transport.
    ///
    /// # Errors
    ///
    /// Returns an error if the close handshake fails.
    async fn close(&mut self) -> Result<()>;
}

/// Inbound half of a transport.
#[async_trait]
pub trait FrameSource: Send + 'static {
    /// Waits for the next event.
    ///
    /// After [`TransportEvent::Closed`] is returned the source is not
    /// polled again.
    async fn recv(&mut self) -> TransportEvent;
}

/// Opens transports.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Opens a new transport to `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connection`](crate::Error::Connection) if the
    /// endpoint cannot be reached.
    async fn connect(&self, endpoint: &str) -> Result<TransportLink>;
}

// ============================================================================
// TransportLink
// ============================================================================

/// A freshly opened transport, split into its two halves.
pub struct TransportLink {
    /// Outbound half.
    pub sink: Box<dyn FrameSink>,
    /// Inbound half.
    pub source: Box<dyn FrameSource>,
}

impl TransportLink {
    /// Bundles the two halves of a transport.
    #[inline]
    #[must_use]
    pub fn new(sink: impl FrameSink, source: impl FrameSource) -> Self {
        Self {
            sink: Box::new(sink),
            source: Box::new(source),
        }
    }
}

impl std::fmt::Debug for TransportLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportLink").finish_non_exhaustive()
    }
}
