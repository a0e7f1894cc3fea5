//! Builder pattern for connection configuration.
//!
//! Provides a fluent API for configuring and creating [`Connection`]
//! instances.
//!
//! # Example
//!
//! ```no_run
//! use command_link::{Connection, ConnectionOptions, SessionHandshake};
//!
//! # fn example() -> command_link::Result<()> {
//! let connection = Connection::builder()
//!     .endpoint("wss://rtm-a.example.com/")
//!     .fallback_endpoint("wss://rtm-b.example.com/")
//!     .options(ConnectionOptions::realtime())
//!     .handshake(SessionHandshake::new("app-id", "alice"))
//!     .build()?;
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use url::Url;

use crate::error::{Error, Result};
use crate::protocol::{FrameCodec, JsonCodec};
use crate::transport::{Connector, WebSocketConnector};

use super::core::Connection;
use super::options::ConnectionOptions;
use super::session::Handshake;

// ============================================================================
// ConnectionBuilder
// ============================================================================

/// Builder for configuring a [`Connection`] instance.
///
/// Use [`Connection::builder()`] to create a new builder.
#[derive(Default)]
pub struct ConnectionBuilder {
    /// Endpoints in fallback order.
    endpoints: Vec<String>,
    /// Connection tunables.
    options: ConnectionOptions,
    /// Transport factory, WebSocket when unset.
    connector: Option<Arc<dyn Connector>>,
    /// Frame codec, JSON when unset.
    codec: Option<Arc<dyn FrameCodec>>,
    /// Session handshake.
    handshake: Option<Arc<dyn Handshake>>,
}

// ============================================================================
// ConnectionBuilder Implementation
// ============================================================================

impl ConnectionBuilder {
    /// Creates a new builder with default options and no endpoint.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the primary endpoint, replacing any configured endpoints.
    #[inline]
    #[must_use]
    pub fn endpoint(mut self, url: impl Into<String>) -> Self {
        self.endpoints = vec![url.into()];
        self
    }

    /// Adds an endpoint tried after the ones already configured.
    #[inline]
    #[must_use]
    pub fn fallback_endpoint(mut self, url: impl Into<String>) -> Self {
        self.endpoints.push(url.into());
        self
    }

    /// Sets connection options.
    #[inline]
    #[must_use]
    pub fn options(mut self, options: ConnectionOptions) -> Self {
        self.options = options;
        self
    }

    /// Sets the transport factory.
    #[inline]
    #[must_use]
    pub fn connector(mut self, connector: impl Connector) -> Self {
        self.connector = Some(Arc::new(connector));
        self
    }

    /// Sets the frame codec.
    #[inline]
    #[must_use]
    pub fn codec(mut self, codec: impl FrameCodec) -> Self {
        self.codec = Some(Arc::new(codec));
        self
    }

    /// Sets the session handshake.
    #[inline]
    #[must_use]
    pub fn handshake(mut self, handshake: impl Handshake) -> Self {
        self.handshake = Some(Arc::new(handshake));
        self
    }

    /// Builds the connection with validation.
    ///
    /// The connection starts [`Idle`](super::ConnectionState::Idle); call
    /// [`Connection::connect`] to open it.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if no endpoint is set or one does not parse
    /// - [`Error::Config`] if no handshake is set
    /// - [`Error::Config`] if `max_pending` is zero
    pub fn build(self) -> Result<Connection> {
        self.validate_endpoints()?;

        let handshake = self.handshake.ok_or_else(|| {
            Error::config(
                "Session handshake is required. Use .handshake() to set it.\n\
                 Example: Connection::builder().handshake(SessionHandshake::new(\"app\", \"peer\"))",
            )
        })?;

        if self.options.max_pending == 0 {
            return Err(Error::config("max_pending must be at least 1"));
        }

        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(WebSocketConnector::new()));
        let codec = self.codec.unwrap_or_else(|| Arc::new(JsonCodec));

        Ok(Connection::from_parts(
            self.endpoints,
            self.options,
            connector,
            codec,
            handshake,
        ))
    }
}

// ============================================================================
// Validation
// ============================================================================

impl ConnectionBuilder {
    fn validate_endpoints(&self) -> Result<()> {
        if self.endpoints.is_empty() {
            return Err(Error::config(
                "At least one endpoint is required. Use .endpoint() to set it.\n\
                 Example: Connection::builder().endpoint(\"wss://rtm.example.com/\")",
            ));
        }

        for endpoint in &self.endpoints {
            Url::parse(endpoint)
                .map_err(|e| Error::config(format!("Invalid endpoint '{endpoint}': {e}")))?;
        }

        Ok(())
    }
}

impl std::fmt::Debug for ConnectionBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionBuilder")
            .field("endpoints", &self.endpoints)
            .field("options", &self.options)
            .field("custom_connector", &self.connector.is_some())
            .field("custom_codec", &self.codec.is_some())
            .field("handshake", &self.handshake.is_some())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
