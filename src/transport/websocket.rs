//! WebSocket client transport.
//!
//! Opens a `ws://` (or `wss://` when tungstenite is built with TLS)
//! connection and exposes it as a [`FrameSink`] / [`FrameSource`] pair.
//!
//! # Frame Mapping
//!
//! | WebSocket message | Transport event |
//! |-------------------|-----------------|
//! | Binary / Text | [`TransportEvent::Frame`] |
//! | Close | [`TransportEvent::Closed`] with the peer's code and reason |
//! | stream error / end | [`TransportEvent::Closed`] with code 1006 |
//! | Ping / Pong | handled by tungstenite, not surfaced |

// ============================================================================
// Imports
// ============================================================================

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, trace};

use crate::error::{Error, Result};

use super::{CLOSE_ABNORMAL, Connector, FrameSink, FrameSource, TransportEvent, TransportLink};

// ============================================================================
// Types
// ============================================================================

type ClientStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ============================================================================
// WebSocketConnector
// ============================================================================

/// Opens WebSocket transports.
///
/// # Example
///
/// ```ignore
/// use command_link::transport::WebSocketConnector;
///
/// let connector = WebSocketConnector::new().with_subprotocol("json.1");
/// let link = connector.connect("ws://127.0.0.1:9000").await?;
/// ```
#[derive(Debug, Clone, Default)]
pub struct WebSocketConnector {
    /// Value of the `Sec-WebSocket-Protocol` header.
    subprotocol: Option<String>,
}

impl WebSocketConnector {
    /// Creates a connector without a subprotocol.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the subprotocol requested during the upgrade.
    #[inline]
    #[must_use]
    pub fn with_subprotocol(mut self, subprotocol: impl Into<String>) -> Self {
        self.subprotocol = Some(subprotocol.into());
        self
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, endpoint: &str) -> Result<TransportLink> {
        let mut request = endpoint.into_client_request()?;

        if let Some(subprotocol) = &self.subprotocol {
            let value = HeaderValue::from_str(subprotocol)
                .map_err(|e| Error::config(format!("Invalid subprotocol: {e}")))?;
            request
                .headers_mut()
                .insert("Sec-WebSocket-Protocol", value);
        }

        let (stream, response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| Error::connection(format!("WebSocket connect to {endpoint} failed: {e}")))?;

        info!(endpoint, status = %response.status(), "WebSocket connection established");

        let (write, read) = stream.split();
        Ok(TransportLink::new(WebSocketSink { write }, WebSocketSource { read }))
    }
}

// ============================================================================
// WebSocketSink
// ============================================================================

struct WebSocketSink {
    write: SplitSink<ClientStream, Message>,
}

#[async_trait]
impl FrameSink for WebSocketSink {
    async fn send(&mut self, frame: Vec<u8>) -> Result<()> {
        self.write.send(Message::Binary(frame.into())).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.write.close().await?;
        Ok(())
    }
}

// ============================================================================
// WebSocketSource
// ============================================================================

struct WebSocketSource {
    read: SplitStream<ClientStream>,
}

#[async_trait]
impl FrameSource for WebSocketSource {
    async fn recv(&mut self) -> TransportEvent {
        loop {
            match self.read.next().await {
                Some(Ok(Message::Binary(data))) => return TransportEvent::Frame(data.to_vec()),

                Some(Ok(Message::Text(text))) => {
                    return TransportEvent::Frame(text.as_bytes().to_vec());
                }

                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "WebSocket closed by remote");
                    return match frame {
                        Some(frame) => {
                            TransportEvent::closed(u16::from(frame.code), frame.reason.to_string())
                        }
                        None => TransportEvent::closed(CLOSE_ABNORMAL, "closed without frame"),
                    };
                }

                Some(Err(e)) => {
                    error!(error = %e, "WebSocket error");
                    return TransportEvent::closed(CLOSE_ABNORMAL, e.to_string());
                }

                None => {
                    debug!("WebSocket stream ended");
                    return TransportEvent::closed(CLOSE_ABNORMAL, "stream ended");
                }

                // Ping, Pong, raw frames
                Some(Ok(other)) => trace!(len = other.len(), "Ignoring control message"),
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
