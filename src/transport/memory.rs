//! In-process transport.
//!
//! [`channel`] returns a [`MemoryConnector`] for the connection and a
//! [`MemoryAcceptor`] playing the backend. Every successful
//! [`Connector::connect`] yields one [`MemoryPeer`] on the acceptor side.
//!
//! Fault injection:
//!
//! - [`MemoryAcceptor::refuse_next`] fails the next `n` connect attempts
//! - [`MemoryAcceptor::stall_sends`] makes client sends hang forever
//!
//! # Example
//!
//! ```ignore
//! let (connector, mut acceptor) = transport::memory::channel();
//! // hand `connector` to the connection builder, then:
//! let mut peer = acceptor.accept().await.unwrap();
//! let open = peer.recv_command().await.unwrap();
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{Error, Result};
use crate::protocol::{Command, FrameCodec, JsonCodec, Operation};

use super::{CLOSE_ABNORMAL, Connector, FrameSink, FrameSource, TransportEvent, TransportLink};

// ============================================================================
// Constructor
// ============================================================================

/// Creates a connected connector/acceptor pair.
#[must_use]
pub fn channel() -> (MemoryConnector, MemoryAcceptor) {
    let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
    let faults = Arc::new(Faults::default());

    (
        MemoryConnector {
            accepted: accepted_tx,
            faults: Arc::clone(&faults),
        },
        MemoryAcceptor {
            accepted: accepted_rx,
            faults,
        },
    )
}

#[derive(Debug, Default)]
struct Faults {
    refuse: AtomicUsize,
    stall: AtomicBool,
}

// ============================================================================
// MemoryConnector
// ============================================================================

/// Client side of the in-process transport.
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    accepted: mpsc::UnboundedSender<MemoryPeer>,
    faults: Arc<Faults>,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, endpoint: &str) -> Result<TransportLink> {
        let refused = self
            .faults
            .refuse
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(Error::connection(format!("{endpoint} refused connection")));
        }

        let (to_peer, from_client) = mpsc::unbounded_channel();
        let (to_client, from_peer) = mpsc::unbounded_channel();

        let peer = MemoryPeer {
            endpoint: endpoint.to_string(),
            from_client,
            to_client,
        };
        self.accepted
            .send(peer)
            .map_err(|_| Error::connection(format!("{endpoint} is not listening")))?;

        debug!(endpoint, "Memory transport connected");

        Ok(TransportLink::new(
            MemorySink {
                to_peer: Some(to_peer),
                faults: Arc::clone(&self.faults),
            },
            MemorySource { from_peer },
        ))
    }
}

// ============================================================================
// MemoryAcceptor
// ============================================================================

/// Backend side: yields one [`MemoryPeer`] per accepted transport.
#[derive(Debug)]
pub struct MemoryAcceptor {
    accepted: mpsc::UnboundedReceiver<MemoryPeer>,
    faults: Arc<Faults>,
}

impl MemoryAcceptor {
    /// Waits for the next transport.
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.accepted.recv().await
    }

    /// Returns an already accepted transport, if any.
    pub fn try_accept(&mut self) -> Option<MemoryPeer> {
        self.accepted.try_recv().ok()
    }

    /// Refuses the next `count` connect attempts.
    pub fn refuse_next(&self, count: usize) {
        self.faults.refuse.store(count, Ordering::SeqCst);
    }

    /// When set, client sends never complete.
    pub fn stall_sends(&self, stall: bool) {
        self.faults.stall.store(stall, Ordering::SeqCst);
    }
}

// ============================================================================
// MemoryPeer
// ============================================================================

/// Backend end of one transport.
#[derive(Debug)]
pub struct MemoryPeer {
    endpoint: String,
    from_client: mpsc::UnboundedReceiver<Vec<u8>>,
    to_client: mpsc::UnboundedSender<TransportEvent>,
}

impl MemoryPeer {
    /// Endpoint the client connected to.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Waits for the next frame sent by the client.
    ///
    /// Returns `None` once the client closed the transport.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.from_client.recv().await
    }

    /// Waits for the next frame and decodes it with [`JsonCodec`].
    ///
    /// Returns `None` once the client closed the transport or on an
    /// undecodable frame.
    pub async fn recv_command(&mut self) -> Option<Command> {
        let frame = self.recv().await?;
        JsonCodec.decode(&frame).ok()
    }

    /// Sends a raw frame to the client. Returns `false` if it is gone.
    pub fn send(&self, frame: impl Into<Vec<u8>>) -> bool {
        self.to_client.send(TransportEvent::Frame(frame.into())).is_ok()
    }

    /// Encodes a command with [`JsonCodec`] and sends it.
    pub fn send_command(&self, command: &Command) -> bool {
        match JsonCodec.encode(command) {
            Ok(frame) => self.send(frame),
            Err(_) => false,
        }
    }

    /// Answers `request` with `op` and `body`, echoing its request id.
    pub fn reply(&self, request: &Command, op: Operation, body: Value) -> bool {
        let mut response = Command::new(request.kind, op, body);
        response.request_id = request.request_id;
        self.send_command(&response)
    }

    /// Closes the transport from the backend side.
    pub fn close(&self, code: u16, reason: &str) {
        let _ = self.to_client.send(TransportEvent::closed(code, reason));
    }
}

// ============================================================================
// Client halves
// ============================================================================

struct MemorySink {
    to_peer: Option<mpsc::UnboundedSender<Vec<u8>>>,
    faults: Arc<Faults>,
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send(&mut self, frame: Vec<u8>) -> Result<()> {
        if self.faults.stall.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.to_peer
            .as_ref()
            .ok_or(Error::ConnectionClosed)?
            .send(frame)
            .map_err(|_| Error::ConnectionClosed)
    }

    async fn close(&mut self) -> Result<()> {
        self.to_peer = None;
        Ok(())
    }
}

struct MemorySource {
    from_peer: mpsc::UnboundedReceiver<TransportEvent>,
}

#[async_trait]
impl FrameSource for MemorySource {
    async fn recv(&mut self) -> TransportEvent {
        self.from_peer
            .recv()
            .await
            .unwrap_or_else(|| TransportEvent::closed(CLOSE_ABNORMAL, "peer dropped"))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use crate::protocol::CommandKind;

    #[tokio::test]
    async fn test_frames_flow_both_ways() {
        let (connector, mut acceptor) = channel();
        let TransportLink { mut sink, mut source } =
            connector.connect("memory://a").await.expect("connect");
        let mut peer = acceptor.accept().await.expect("peer");

        assert_eq!(peer.endpoint(), "memory://a");

        sink.send(b"ping".to_vec()).await.expect("send");
        assert_eq!(peer.recv().await, Some(b"ping".to_vec()));

        assert!(peer.send_command(&Command::bare(CommandKind::Echo)));
        let TransportEvent::Frame(frame) = source.recv().await else {
            panic!("expected frame");
        };
        assert_eq!(JsonCodec.decode(&frame).expect("decode").kind, CommandKind::Echo);
    }

    #[tokio::test]
    async fn test_close_is_observed_on_both_sides() {
        let (connector, mut acceptor) = channel();
        let TransportLink { mut sink, mut source } =
            connector.connect("memory://a").await.expect("connect");
        let mut peer = acceptor.accept().await.expect("peer");

        sink.close().await.expect("close");
        assert_eq!(peer.recv().await, None);

        peer.close(4000, "bye");
        assert_eq!(source.recv().await, TransportEvent::closed(4000, "bye"));
    }

    #[tokio::test]
    async fn test_dropped_peer_reports_abnormal_close() {
        let (connector, mut acceptor) = channel();
        let TransportLink { mut source, .. } =
            connector.connect("memory://a").await.expect("connect");
        drop(acceptor.accept().await);

        let TransportEvent::Closed { code, .. } = source.recv().await else {
            panic!("expected close");
        };
        assert_eq!(code, CLOSE_ABNORMAL);
    }

    #[tokio::test]
    async fn test_stalled_sink_never_completes() {
        let (connector, acceptor) = channel();
        let TransportLink { mut sink, .. } =
            connector.connect("memory://a").await.expect("connect");
        acceptor.stall_sends(true);

        let mut send = tokio_test::task::spawn(sink.send(b"x".to_vec()));
        tokio_test::assert_pending!(send.poll());
        tokio_test::assert_pending!(send.poll());
    }

    #[tokio::test]
    async fn test_refuse_next() {
        let (connector, acceptor) = channel();
        acceptor.refuse_next(1);

        assert!(connector.connect("memory://a").await.is_err());
        assert!(connector.connect("memory://a").await.is_ok());
    }
}
