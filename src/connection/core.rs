//! The connection itself.
//!
//! A [`Connection`] outlives its transports. Every connect cycle opens a new
//! transport, spawns one reader and one writer task for it and performs the
//! session handshake; a transport loss closes the cycle without replacing
//! the connection, so the request id counter, the notification handler and
//! the stored session credential carry over to the next cycle.
//!
//! # Tasks
//!
//! ```text
//!            send_request / send_command
//!                      │
//!                      ▼ mpsc
//!  ┌────────┐    ┌──────────┐        ┌─────────────┐
//!  │heartbeat├──►│  writer  ├───────►│  FrameSink  │
//!  └────────┘    └──────────┘        └─────────────┘
//!
//!  ┌─────────────┐    ┌──────────┐    classify ─┬─► registry (responses)
//!  │ FrameSource ├───►│  reader  ├──────────────┼─► heartbeat (echo)
//!  └─────────────┘    └──────────┘              ├─► force close (goaway, conn/closed)
//!                                               └─► dispatcher (notifications)
//! ```
//!
//! Background tasks hold a [`Weak`] reference, so dropping the last
//! [`Connection`] handle tears everything down.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, trace, warn};

use crate::error::{Error, Result};
use crate::identifiers::ConnectionId;
use crate::protocol::{Command, CommandKind, FrameCodec, Inbound, Operation, classify, is_idempotent};
use crate::transport::{Connector, FrameSink, FrameSource, TransportEvent, TransportLink};

use super::builder::ConnectionBuilder;
use super::dispatcher::NotificationDispatcher;
use super::heartbeat::HeartbeatMonitor;
use super::options::{ConnectionOptions, ReconnectPolicy};
use super::registry::RequestRegistry;
use super::session::{Handshake, HandshakeOutcome, SessionCredential};
use super::state::{
    CLOSE_BY_SERVER, CLOSE_GOAWAY, CLOSE_HEARTBEAT_TIMEOUT, ConnectionEvent, ConnectionState,
    EventHandler, OpenOutcome,
};

// ============================================================================
// Constants
// ============================================================================

/// Time the writer gets to flush and close the transport on `close()`.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

// ============================================================================
// Types
// ============================================================================

type ConnectFuture = Shared<BoxFuture<'static, Result<OpenOutcome>>>;

/// Work item for the writer task.
enum Outbound {
    Frame {
        bytes: Vec<u8>,
        done: Option<oneshot::Sender<Result<()>>>,
    },
    Close,
}

/// Tasks and queue of the live transport.
struct LiveLink {
    generation: u64,
    outbound: mpsc::UnboundedSender<Outbound>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl LiveLink {
    /// Lets the writer drain and close the sink, stops reading.
    fn shutdown(self) {
        let _ = self.outbound.send(Outbound::Close);
        self.reader.abort();
    }
}

struct LinkState {
    state: ConnectionState,
    generation: u64,
    link: Option<LiveLink>,
}

// ============================================================================
// Connection
// ============================================================================

/// A persistent, multiplexed command connection.
///
/// Cheap to clone; all clones drive the same connection.
///
/// # Example
///
/// ```ignore
/// use command_link::{CommandKind, Connection, ConnectionOptions, Operation, SessionHandshake};
///
/// let connection = Connection::builder()
///     .endpoint("wss://rtm.example.com/")
///     .options(ConnectionOptions::lobby())
///     .handshake(SessionHandshake::new("app-id", "alice"))
///     .build()?;
///
/// connection.set_notification_handler(|command| println!("push: {command}"));
/// connection.connect().await?;
///
/// let reply = connection
///     .send_request(CommandKind::Conv, Operation::Query, serde_json::json!({"limit": 10}))
///     .await?;
/// ```
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

struct Inner {
    id: ConnectionId,
    endpoints: Vec<String>,
    options: ConnectionOptions,
    connector: Arc<dyn Connector>,
    codec: Arc<dyn FrameCodec>,
    handshake: Arc<dyn Handshake>,

    link: Mutex<LinkState>,
    registry: RequestRegistry,
    dispatcher: NotificationDispatcher,
    heartbeat: HeartbeatMonitor,
    credential: Mutex<Option<SessionCredential>>,

    connecting: Mutex<Option<ConnectFuture>>,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
    closed_by_user: AtomicBool,
    event_handler: Mutex<Option<EventHandler>>,
}

// ============================================================================
// Connection - Construction
// ============================================================================

impl Connection {
    /// Creates a builder.
    #[inline]
    #[must_use]
    pub fn builder() -> ConnectionBuilder {
        ConnectionBuilder::new()
    }

    pub(crate) fn from_parts(
        endpoints: Vec<String>,
        options: ConnectionOptions,
        connector: Arc<dyn Connector>,
        codec: Arc<dyn FrameCodec>,
        handshake: Arc<dyn Handshake>,
    ) -> Self {
        let inner = Inner {
            id: ConnectionId::generate(),
            endpoints,
            registry: RequestRegistry::new(options.max_pending),
            heartbeat: HeartbeatMonitor::new(options.heartbeat),
            options,
            connector,
            codec,
            handshake,
            link: Mutex::new(LinkState {
                state: ConnectionState::Idle,
                generation: 0,
                link: None,
            }),
            dispatcher: NotificationDispatcher::new(),
            credential: Mutex::new(None),
            connecting: Mutex::new(None),
            reconnect_task: Mutex::new(None),
            closed_by_user: AtomicBool::new(false),
            event_handler: Mutex::new(None),
        };

        debug!(connection = %inner.id, endpoints = ?inner.endpoints, "Connection created");
        Self {
            inner: Arc::new(inner),
        }
    }
}

// ============================================================================
// Connection - Accessors
// ============================================================================

impl Connection {
    /// Unique id of this connection, used in log fields.
    #[inline]
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    /// Current state.
    #[inline]
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.link.lock().state
    }

    /// Configured endpoints, in fallback order.
    #[inline]
    #[must_use]
    pub fn endpoints(&self) -> &[String] {
        &self.inner.endpoints
    }

    /// Configured options.
    #[inline]
    #[must_use]
    pub fn options(&self) -> &ConnectionOptions {
        &self.inner.options
    }

    /// Number of requests awaiting a response.
    #[inline]
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.registry.len()
    }

    /// Number of notifications buffered by [`pause`](Self::pause).
    #[inline]
    #[must_use]
    pub fn buffered_notifications(&self) -> usize {
        self.inner.dispatcher.buffered_len()
    }

    /// Session credential from the last successful handshake.
    #[must_use]
    pub fn credential(&self) -> Option<SessionCredential> {
        self.inner.credential.lock().clone()
    }

    /// Replaces the stored session credential.
    ///
    /// The next [`reopen`](Self::reopen) offers it to the server.
    pub fn set_credential(&self, credential: Option<SessionCredential>) {
        *self.inner.credential.lock() = credential;
    }
}

// ============================================================================
// Connection - Handlers
// ============================================================================

impl Connection {
    /// Sets the handler receiving push notifications, in arrival order.
    pub fn set_notification_handler<F>(&self, handler: F)
    where
        F: Fn(Command) + Send + Sync + 'static,
    {
        self.inner.dispatcher.set_handler(Arc::new(handler));
    }

    /// Removes the notification handler.
    pub fn clear_notification_handler(&self) {
        self.inner.dispatcher.clear_handler();
    }

    /// Sets the handler receiving [`ConnectionEvent`]s.
    pub fn set_event_handler<F>(&self, handler: F)
    where
        F: Fn(ConnectionEvent) + Send + Sync + 'static,
    {
        *self.inner.event_handler.lock() = Some(Arc::new(handler));
    }

    /// Removes the event handler.
    pub fn clear_event_handler(&self) {
        *self.inner.event_handler.lock() = None;
    }
}

// ============================================================================
// Connection - Lifecycle
// ============================================================================

impl Connection {
    /// Opens the transport and a fresh session.
    ///
    /// Returns immediately if already open. Concurrent calls while
    /// connecting join the same attempt and share its outcome.
    ///
    /// # Errors
    ///
    /// - [`Error::Connection`] if no endpoint accepted the transport
    /// - [`Error::ConnectionTimeout`] if the handshake did not complete in time
    /// - [`Error::SessionRejected`] if the server refused the session
    /// - [`Error::ConnectionClosed`] if [`close`](Self::close) interrupted the attempt
    pub async fn connect(&self) -> Result<()> {
        self.inner.closed_by_user.store(false, Ordering::SeqCst);
        Inner::begin(&self.inner, false).await.map(|_| ())
    }

    /// Opens a new transport and tries to resume the previous session.
    ///
    /// A rejected resume still leaves the connection open with a fresh
    /// session; it is reported as [`OpenOutcome::SessionLost`] and
    /// [`ConnectionEvent::SessionClosed`], and the stored credential is
    /// discarded.
    ///
    /// # Errors
    ///
    /// Same as [`connect`](Self::connect), except for session rejection.
    pub async fn reopen(&self) -> Result<OpenOutcome> {
        self.inner.closed_by_user.store(false, Ordering::SeqCst);
        Inner::begin(&self.inner, true).await
    }

    /// Closes the connection.
    ///
    /// Stops the heartbeat and any automatic reconnection, sends the
    /// configured close command, closes the transport and fails every
    /// outstanding request with [`Error::ConnectionReset`]. No
    /// [`ConnectionEvent::Disconnected`] is emitted.
    ///
    /// # Errors
    ///
    /// Currently infallible; the result is kept for transports whose close
    /// can fail.
    pub async fn close(&self) -> Result<()> {
        let inner = &self.inner;
        inner.closed_by_user.store(true, Ordering::SeqCst);
        if let Some(task) = inner.reconnect_task.lock().take() {
            task.abort();
        }

        let (previous, link) = {
            let mut link = inner.link.lock();
            let previous = link.state;
            if matches!(previous, ConnectionState::Idle | ConnectionState::Closed) {
                return Ok(());
            }
            link.state = ConnectionState::Closed;
            (previous, link.link.take())
        };

        inner.heartbeat.stop();

        if let Some(link) = link {
            if previous.is_live()
                && let Some((kind, op)) = inner.options.close_command
            {
                let command = Command::new(kind, op, Value::Null);
                match inner.codec.encode(&command) {
                    Ok(bytes) => {
                        debug!(connection = %inner.id, "=> {command}");
                        let _ = link.outbound.send(Outbound::Frame { bytes, done: None });
                    }
                    Err(e) => warn!(connection = %inner.id, error = %e, "Failed to encode close command"),
                }
            }

            let LiveLink {
                outbound,
                reader,
                writer,
                ..
            } = link;
            let _ = outbound.send(Outbound::Close);
            drop(outbound);
            reader.abort();

            let failed = inner.registry.fail_all(&Error::ConnectionReset);
            debug!(connection = %inner.id, failed, "Pending requests failed");

            let abort = writer.abort_handle();
            if time::timeout(CLOSE_GRACE, writer).await.is_err() {
                warn!(connection = %inner.id, "Writer did not finish, aborting");
                abort.abort();
            }
        }

        let failed = inner.registry.fail_all(&Error::ConnectionReset);
        info!(connection = %inner.id, from = %previous, failed, "Connection closed");
        Ok(())
    }

    /// Buffers notifications instead of delivering them.
    ///
    /// Requests and responses keep flowing. Idempotent while paused.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] unless the connection is open.
    pub fn pause(&self) -> Result<()> {
        let mut link = self.inner.link.lock();
        match link.state {
            ConnectionState::Open => {
                link.state = ConnectionState::Paused;
                self.inner.dispatcher.pause();
                debug!(connection = %self.inner.id, "Connection paused");
                Ok(())
            }
            ConnectionState::Paused => Ok(()),
            state => Err(Error::invalid_state("pause", state)),
        }
    }

    /// Delivers buffered notifications in order, then resumes live delivery.
    ///
    /// Idempotent while open.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] unless the connection is open or
    /// paused.
    pub fn resume(&self) -> Result<()> {
        let must_drain = {
            let mut link = self.inner.link.lock();
            match link.state {
                ConnectionState::Paused => {
                    link.state = ConnectionState::Open;
                    self.inner.dispatcher.unpause()
                }
                ConnectionState::Open => return Ok(()),
                state => return Err(Error::invalid_state("resume", state)),
            }
        };

        let replayed = if must_drain {
            self.inner.dispatcher.drain()
        } else {
            0
        };
        debug!(connection = %self.inner.id, replayed, "Connection resumed");
        Ok(())
    }
}

// ============================================================================
// Connection - Exchange
// ============================================================================

impl Connection {
    /// Sends a request and waits for its response.
    ///
    /// The send phase is bounded by
    /// [`send_timeout`](ConnectionOptions::send_timeout); once the frame is
    /// handed to the transport the request waits for its response or for
    /// the transport to go away.
    ///
    /// # Errors
    ///
    /// - [`Error::RequestTimeout`] if the frame was not sent in time
    /// - [`Error::Server`] if the server answered with an error
    /// - [`Error::ConnectionReset`] if the transport went away first
    /// - [`Error::ConnectionClosed`] / [`Error::InvalidState`] if not open
    /// - [`Error::Protocol`] if too many requests are outstanding
    pub async fn send_request(
        &self,
        kind: CommandKind,
        op: Operation,
        body: Value,
    ) -> Result<Command> {
        self.inner.ensure_live("send request")?;
        let coalesce = self.inner.options.coalesce_duplicates && is_idempotent(kind, Some(op));
        self.inner.exchange(Command::new(kind, op, body), coalesce).await
    }

    /// Sends a command without waiting for a response.
    ///
    /// # Errors
    ///
    /// - [`Error::SendTimeout`] if the frame was not sent in time
    /// - [`Error::ConnectionClosed`] / [`Error::InvalidState`] if not open
    pub async fn send_command(&self, kind: CommandKind, op: Operation, body: Value) -> Result<()> {
        self.inner.ensure_live("send command")?;
        let command = Command::new(kind, op, body);
        let bytes = self.inner.codec.encode(&command)?;
        debug!(connection = %self.inner.id, "=> {command}");
        self.inner.transmit(bytes).await
    }
}

// ============================================================================
// Inner - Connect Cycle
// ============================================================================

impl Inner {
    /// Joins the in-flight connect attempt or starts a new one.
    async fn begin(self: &Arc<Self>, rejoin: bool) -> Result<OpenOutcome> {
        let attempt = {
            let mut slot = self.connecting.lock();
            match slot.as_ref() {
                Some(attempt) => {
                    debug!(connection = %self.id, "Joining in-flight connect");
                    attempt.clone()
                }
                None => {
                    let inner = Arc::clone(self);
                    let task = tokio::spawn(async move {
                        let outcome = inner.connect_cycle(rejoin).await;
                        *inner.connecting.lock() = None;
                        outcome
                    });
                    let attempt = async move {
                        task.await
                            .unwrap_or_else(|e| Err(Error::connection(format!("Connect task failed: {e}"))))
                    }
                    .boxed()
                    .shared();
                    *slot = Some(attempt.clone());
                    attempt
                }
            }
        };

        attempt.await
    }

    async fn connect_cycle(self: &Arc<Self>, rejoin: bool) -> Result<OpenOutcome> {
        {
            let mut link = self.link.lock();
            if link.state.is_live() {
                return Ok(OpenOutcome::AlreadyOpen);
            }
            link.state = ConnectionState::Connecting;
        }

        info!(connection = %self.id, rejoin, "Connecting");
        let timeout = self.options.handshake_timeout;

        let transport = match time::timeout(timeout, self.open_transport()).await {
            Ok(Ok(transport)) => transport,
            Ok(Err(e)) => {
                self.abort_connect(None);
                return Err(e);
            }
            Err(_) => {
                self.abort_connect(None);
                return Err(Error::connection_timeout(millis(timeout)));
            }
        };
        let generation = self.install_link(transport)?;

        let credential = if rejoin {
            self.credential
                .lock()
                .clone()
                .filter(|credential| !credential.is_expired())
        } else {
            None
        };
        let open = self.handshake.open_command(rejoin, credential.as_ref());

        let outcome = match time::timeout(timeout, self.exchange(open, false)).await {
            Ok(Ok(reply)) => self.handshake.interpret(&reply),
            Ok(Err(Error::Server { code, detail, .. })) => Ok(HandshakeOutcome::Rejected {
                code,
                reason: detail,
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::connection_timeout(millis(timeout))),
        };

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(connection = %self.id, error = %e, "Handshake failed");
                self.abort_connect(Some(generation));
                return Err(e);
            }
        };

        match outcome {
            HandshakeOutcome::Opened { credential } => {
                if let Some(credential) = credential {
                    *self.credential.lock() = Some(credential);
                }
                self.mark_open(generation)?;
                if rejoin {
                    self.emit(ConnectionEvent::Resumed);
                    Ok(OpenOutcome::Resumed)
                } else {
                    Ok(OpenOutcome::Opened)
                }
            }

            HandshakeOutcome::Rejected { code, reason } if rejoin => {
                warn!(connection = %self.id, code, %reason, "Session could not be resumed");
                *self.credential.lock() = None;
                self.mark_open(generation)?;
                self.emit(ConnectionEvent::SessionClosed {
                    code,
                    reason: reason.clone(),
                });
                Ok(OpenOutcome::SessionLost { code, reason })
            }

            HandshakeOutcome::Rejected { code, reason } => {
                warn!(connection = %self.id, code, %reason, "Session rejected");
                self.abort_connect(Some(generation));
                Err(Error::session_rejected(code, reason))
            }
        }
    }

    /// Tries each endpoint in order.
    async fn open_transport(&self) -> Result<TransportLink> {
        let mut last_error = None;

        for endpoint in &self.endpoints {
            match self.connector.connect(endpoint).await {
                Ok(transport) => {
                    info!(connection = %self.id, endpoint, "Transport connected");
                    return Ok(transport);
                }
                Err(e) => {
                    warn!(connection = %self.id, endpoint, error = %e, "Endpoint unavailable");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| Error::config("No endpoints configured")))
    }

    /// Spawns the reader and writer for a new transport.
    fn install_link(self: &Arc<Self>, transport: TransportLink) -> Result<u64> {
        let TransportLink { mut sink, source } = transport;
        let mut link = self.link.lock();

        if link.state != ConnectionState::Connecting {
            drop(link);
            debug!(connection = %self.id, "Connect interrupted, dropping transport");
            tokio::spawn(async move {
                let _ = sink.close().await;
            });
            return Err(Error::ConnectionClosed);
        }

        link.generation += 1;
        let generation = link.generation;
        let (outbound, queue) = mpsc::unbounded_channel();

        let writer = tokio::spawn(run_writer(self.id, sink, queue));
        let reader = tokio::spawn(run_reader(Arc::downgrade(self), source, generation));

        link.link = Some(LiveLink {
            generation,
            outbound,
            reader,
            writer,
        });
        Ok(generation)
    }

    fn mark_open(self: &Arc<Self>, generation: u64) -> Result<()> {
        {
            let mut link = self.link.lock();
            if link.state != ConnectionState::Connecting || link.generation != generation {
                return Err(Error::ConnectionClosed);
            }
            link.state = if self.dispatcher.is_paused() {
                ConnectionState::Paused
            } else {
                ConnectionState::Open
            };
        }

        self.start_heartbeat(generation);
        info!(connection = %self.id, "Connection open");
        Ok(())
    }

    /// Returns a failed connect attempt to `Closed`.
    fn abort_connect(&self, generation: Option<u64>) {
        let link = {
            let mut link = self.link.lock();
            if link.state != ConnectionState::Connecting {
                return;
            }
            if let Some(generation) = generation
                && link.generation != generation
            {
                return;
            }
            link.state = ConnectionState::Closed;
            link.link.take()
        };

        if let Some(link) = link {
            link.shutdown();
        }
        self.registry.fail_all(&Error::ConnectionReset);
    }

    fn start_heartbeat(self: &Arc<Self>, generation: u64) {
        let probe = {
            let inner = Arc::downgrade(self);
            move || {
                if let Some(inner) = inner.upgrade() {
                    inner.send_probe();
                }
            }
        };
        let on_timeout = {
            let inner = Arc::downgrade(self);
            move || {
                if let Some(inner) = inner.upgrade() {
                    inner.force_close(generation, CLOSE_HEARTBEAT_TIMEOUT, "heartbeat timeout");
                }
            }
        };

        self.heartbeat.start(probe, on_timeout);
    }
}

// ============================================================================
// Inner - Exchange
// ============================================================================

impl Inner {
    fn ensure_live(&self, operation: &'static str) -> Result<()> {
        match self.link.lock().state {
            ConnectionState::Open | ConnectionState::Paused => Ok(()),
            ConnectionState::Closed => Err(Error::ConnectionClosed),
            state => Err(Error::invalid_state(operation, state)),
        }
    }

    /// Registers, sends and awaits one request.
    async fn exchange(&self, command: Command, coalesce: bool) -> Result<Command> {
        let fingerprint = coalesce.then(|| command.fingerprint());

        if let Some(fingerprint) = &fingerprint
            && let Some(joined) = self.registry.join(fingerprint)
        {
            return joined.await.unwrap_or_else(|_| Err(Error::ConnectionReset));
        }

        let (id, mut response) = self.registry.register(fingerprint)?;
        let command = command.with_request_id(id);

        let send = async {
            let bytes = self.codec.encode(&command)?;
            debug!(connection = %self.id, "=> {command}");
            self.transmit(bytes).await.map_err(|e| match e {
                Error::SendTimeout { timeout_ms } => Error::request_timeout(id, timeout_ms),
                other => other,
            })
        };

        // A close fails the slot while the frame may still sit in a stalled writer.
        tokio::select! {
            biased;
            settled = &mut response => return settled.unwrap_or_else(|_| Err(Error::ConnectionReset)),
            sent = send => {
                if let Err(e) = sent {
                    self.registry.fail(id, e);
                }
            }
        }

        response.await.unwrap_or_else(|_| Err(Error::ConnectionReset))
    }

    /// Hands one frame to the writer and waits until the transport took it.
    async fn transmit(&self, bytes: Vec<u8>) -> Result<()> {
        let outbound = self
            .link
            .lock()
            .link
            .as_ref()
            .map(|link| link.outbound.clone())
            .ok_or(Error::ConnectionClosed)?;

        let (done, sent) = oneshot::channel();
        outbound
            .send(Outbound::Frame {
                bytes,
                done: Some(done),
            })
            .map_err(|_| Error::ConnectionClosed)?;

        let timeout = self.options.send_timeout;
        match time::timeout(timeout, sent).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::ConnectionClosed),
            Err(_) => {
                warn!(connection = %self.id, ?timeout, "Send timed out");
                Err(Error::send_timeout(millis(timeout)))
            }
        }
    }

    fn send_probe(&self) {
        let outbound = self.link.lock().link.as_ref().map(|link| link.outbound.clone());
        let Some(outbound) = outbound else {
            return;
        };

        match self.codec.encode(&Command::bare(CommandKind::Echo)) {
            Ok(bytes) => {
                trace!(connection = %self.id, "=> echo");
                let _ = outbound.send(Outbound::Frame { bytes, done: None });
            }
            Err(e) => warn!(connection = %self.id, error = %e, "Failed to encode probe"),
        }
    }
}

// ============================================================================
// Inner - Inbound
// ============================================================================

impl Inner {
    fn handle_frame(self: &Arc<Self>, generation: u64, bytes: &[u8]) {
        self.heartbeat.frame_received();

        let command = match self.codec.decode(bytes) {
            Ok(command) => command,
            Err(e) => {
                warn!(connection = %self.id, error = %e, len = bytes.len(), "Discarding malformed frame");
                return;
            }
        };

        match classify(&command) {
            Inbound::Response(request_id) => {
                debug!(connection = %self.id, "<= {command}");
                if !self.registry.resolve(command) {
                    debug!(connection = %self.id, %request_id, "Response for unknown request dropped");
                }
            }
            Inbound::Pong => {
                trace!(connection = %self.id, "<= echo");
                self.heartbeat.pong();
            }
            Inbound::Goaway => {
                info!(connection = %self.id, "Server requested reconnect");
                self.force_close(generation, CLOSE_GOAWAY, "goaway");
            }
            Inbound::ServerClose => {
                let reason = match command.get_str("reason") {
                    "" => "closed by server",
                    reason => reason,
                };
                self.force_close(generation, CLOSE_BY_SERVER, reason);
            }
            Inbound::Notification => {
                debug!(connection = %self.id, "<= {command}");
                self.dispatcher.dispatch(command);
            }
        }
    }

    /// Tears down the transport of `generation` after a loss.
    ///
    /// Stale calls for an already replaced transport are ignored, so each
    /// loss emits at most one [`ConnectionEvent::Disconnected`].
    fn force_close(self: &Arc<Self>, generation: u64, code: u16, reason: &str) {
        let (previous, link) = {
            let mut link = self.link.lock();
            if link.link.as_ref().is_none_or(|live| live.generation != generation) {
                return;
            }
            let previous = link.state;
            link.state = ConnectionState::Closed;
            (previous, link.link.take())
        };

        self.heartbeat.stop();
        if let Some(link) = link {
            link.shutdown();
        }
        let failed = self.registry.fail_all(&Error::ConnectionReset);

        warn!(connection = %self.id, code, reason, from = %previous, failed, "Connection lost");

        if previous.is_live() {
            self.emit(ConnectionEvent::Disconnected {
                code,
                reason: reason.to_string(),
            });
            self.schedule_reconnect();
        }
    }

    fn emit(&self, event: ConnectionEvent) {
        debug!(connection = %self.id, ?event, "Connection event");
        let handler = self.event_handler.lock().clone();
        if let Some(handler) = handler {
            handler(event);
        }
    }
}

// ============================================================================
// Inner - Reconnect
// ============================================================================

impl Inner {
    fn schedule_reconnect(self: &Arc<Self>) {
        let policy = self.options.reconnect;
        if !policy.enabled || self.closed_by_user.load(Ordering::SeqCst) {
            return;
        }

        let task = tokio::spawn(run_reconnect(Arc::downgrade(self), policy));
        if let Some(previous) = self.reconnect_task.lock().replace(task) {
            previous.abort();
        }
    }
}

async fn run_reconnect(inner: Weak<Inner>, policy: ReconnectPolicy) {
    let mut attempt = 0;

    loop {
        if policy.max_attempts.is_some_and(|max| attempt >= max) {
            if let Some(inner) = inner.upgrade() {
                warn!(connection = %inner.id, attempts = attempt, "Giving up reconnecting");
                inner.emit(ConnectionEvent::ReconnectFailed { attempts: attempt });
            }
            return;
        }

        time::sleep(policy.interval).await;

        let Some(inner) = inner.upgrade() else {
            return;
        };
        if inner.closed_by_user.load(Ordering::SeqCst) {
            return;
        }

        attempt += 1;
        inner.emit(ConnectionEvent::Reconnecting { attempt });

        match Inner::begin(&inner, true).await {
            Ok(outcome) => {
                info!(connection = %inner.id, attempt, ?outcome, "Reconnected");
                return;
            }
            Err(e) => warn!(connection = %inner.id, attempt, error = %e, "Reconnect attempt failed"),
        }
    }
}

// ============================================================================
// Transport Tasks
// ============================================================================

async fn run_writer(
    id: ConnectionId,
    mut sink: Box<dyn FrameSink>,
    mut queue: mpsc::UnboundedReceiver<Outbound>,
) {
    while let Some(outbound) = queue.recv().await {
        match outbound {
            Outbound::Frame { bytes, done } => {
                let result = sink.send(bytes).await;
                if let Err(e) = &result {
                    warn!(connection = %id, error = %e, "Failed to send frame");
                }
                if let Some(done) = done {
                    let _ = done.send(result);
                }
            }
            Outbound::Close => {
                if let Err(e) = sink.close().await {
                    debug!(connection = %id, error = %e, "Transport close failed");
                }
                break;
            }
        }
    }

    trace!(connection = %id, "Writer finished");
}

async fn run_reader(inner: Weak<Inner>, mut source: Box<dyn FrameSource>, generation: u64) {
    loop {
        let event = source.recv().await;
        let Some(inner) = inner.upgrade() else {
            return;
        };

        match event {
            TransportEvent::Frame(bytes) => inner.handle_frame(generation, &bytes),
            TransportEvent::Closed { code, reason } => {
                inner.force_close(generation, code, &reason);
                return;
            }
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

// ============================================================================
// Trait Implementations
// ============================================================================

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .field("endpoints", &self.inner.endpoints)
            .field("pending", &self.pending_count())
            .finish_non_exhaustive()
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(task) = self.reconnect_task.get_mut().take() {
            task.abort();
        }
        if let Some(link) = self.link.get_mut().link.take() {
            link.shutdown();
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde_json::json;

    use crate::connection::heartbeat::HeartbeatOptions;
    use crate::connection::session::SessionHandshake;
    use crate::identifiers::RequestId;
    use crate::protocol::ErrorInfo;
    use crate::transport::memory::{self, MemoryAcceptor, MemoryPeer};

    fn quiet() -> ConnectionOptions {
        ConnectionOptions::new().without_heartbeat()
    }

    fn build(options: ConnectionOptions) -> (Connection, MemoryAcceptor) {
        let (connector, acceptor) = memory::channel();
        let connection = Connection::builder()
            .endpoint("ws://primary.test/")
            .options(options)
            .connector(connector)
            .handshake(SessionHandshake::new("app", "alice"))
            .build()
            .expect("build");
        (connection, acceptor)
    }

    async fn accept_session(acceptor: &mut MemoryAcceptor) -> MemoryPeer {
        let mut peer = acceptor.accept().await.expect("peer");
        let open = peer.recv_command().await.expect("open");
        assert!(open.is(CommandKind::Session, Operation::Open));
        peer.reply(
            &open,
            Operation::Opened,
            json!({"st": STANDARD.encode(b"token-1"), "stTtl": 3600}),
        );
        peer
    }

    async fn open(options: ConnectionOptions) -> (Connection, MemoryAcceptor, MemoryPeer) {
        let (connection, mut acceptor) = build(options);
        let (connected, peer) = tokio::join!(connection.connect(), accept_session(&mut acceptor));
        connected.expect("connect");
        (connection, acceptor, peer)
    }

    fn record_events(connection: &Connection) -> Arc<Mutex<Vec<ConnectionEvent>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        connection.set_event_handler(move |event| sink.lock().push(event));
        events
    }

    fn record_notifications(connection: &Connection) -> Arc<Mutex<Vec<i64>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        connection.set_notification_handler(move |command| sink.lock().push(command.get_i64("n")));
        seen
    }

    fn notification(n: i64) -> Command {
        Command::new(CommandKind::Conv, Operation::Joined, json!({"n": n}))
    }

    /// Request/response round trip; the reader handled everything sent before.
    async fn round_trip(connection: &Connection, peer: &mut MemoryPeer) {
        let (reply, ()) = tokio::join!(
            connection.send_request(CommandKind::Conv, Operation::Query, json!({})),
            async {
                let request = peer.recv_command().await.expect("request");
                peer.reply(&request, Operation::QueryResult, json!({}));
            }
        );
        reply.expect("round trip");
    }

    async fn wait_for(mut done: impl FnMut() -> bool) {
        time::timeout(Duration::from_secs(5), async {
            while !done() {
                time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    // ------------------------------------------------------------------------
    // Connect
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_connect_opens_session_and_stores_credential() {
        let (connection, _acceptor, _peer) = open(quiet()).await;

        assert_eq!(connection.state(), ConnectionState::Open);
        let credential = connection.credential().expect("credential");
        assert_eq!(credential.token(), b"token-1");
        assert!(credential.expires_at().is_some());
    }

    #[tokio::test]
    async fn test_concurrent_connect_performs_one_handshake() {
        let (connection, mut acceptor) = build(quiet());

        let (first, second, _peer) = tokio::join!(
            connection.connect(),
            connection.connect(),
            accept_session(&mut acceptor)
        );

        assert!(first.is_ok());
        assert!(second.is_ok());
        assert!(acceptor.try_accept().is_none());
        assert_eq!(connection.state(), ConnectionState::Open);

        connection.connect().await.expect("already open");
        assert!(acceptor.try_accept().is_none());
    }

    #[tokio::test]
    async fn test_rejected_session_closes() {
        let (connection, mut acceptor) = build(quiet());

        let (result, _peer) = tokio::join!(connection.connect(), async {
            let mut peer = acceptor.accept().await.expect("peer");
            let open = peer.recv_command().await.expect("open");
            peer.reply(
                &open,
                Operation::Closed,
                json!({"code": 4111, "reason": "login elsewhere"}),
            );
            peer
        });

        let err = result.expect_err("rejected");
        assert!(matches!(err, Error::SessionRejected { code: 4111, .. }));
        assert_eq!(connection.state(), ConnectionState::Closed);
        assert_eq!(connection.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_handshake_error_object_is_rejection() {
        let (connection, mut acceptor) = build(quiet());

        let (result, _peer) = tokio::join!(connection.connect(), async {
            let mut peer = acceptor.accept().await.expect("peer");
            let open = peer.recv_command().await.expect("open");
            let reply = Command::bare(CommandKind::Session)
                .with_request_id(open.request_id.expect("id"))
                .with_error(ErrorInfo::new(4102, "bad signature"));
            peer.send_command(&reply);
            peer
        });

        assert!(matches!(result, Err(Error::SessionRejected { code: 4102, .. })));
        assert_eq!(connection.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_fails_connect() {
        let (connection, acceptor) = build(quiet());
        acceptor.refuse_next(1);

        let err = connection.connect().await.expect_err("refused");
        assert!(matches!(err, Error::Connection { .. }));
        assert_eq!(connection.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_fallback_endpoint() {
        let (connector, mut acceptor) = memory::channel();
        let connection = Connection::builder()
            .endpoint("ws://primary.test/")
            .fallback_endpoint("ws://secondary.test/")
            .options(quiet())
            .connector(connector)
            .handshake(SessionHandshake::new("app", "alice"))
            .build()
            .expect("build");
        acceptor.refuse_next(1);

        let (connected, peer) = tokio::join!(connection.connect(), accept_session(&mut acceptor));

        connected.expect("connect");
        assert_eq!(peer.endpoint(), "ws://secondary.test/");
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_timeout() {
        let (connection, mut acceptor) = build(quiet().with_handshake_timeout(Duration::from_secs(3)));

        let (result, _peer) = tokio::join!(connection.connect(), async {
            let mut peer = acceptor.accept().await.expect("peer");
            let _open = peer.recv_command().await.expect("open");
            peer
        });

        assert!(matches!(result, Err(Error::ConnectionTimeout { timeout_ms: 3000 })));
        assert_eq!(connection.state(), ConnectionState::Closed);
        assert_eq!(connection.pending_count(), 0);
    }

    // ------------------------------------------------------------------------
    // Requests
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_send_before_connect_is_rejected() {
        let (connection, _acceptor) = build(quiet());

        let err = connection
            .send_request(CommandKind::Conv, Operation::Query, json!({}))
            .await
            .expect_err("idle");
        assert!(matches!(
            err,
            Error::InvalidState {
                state: ConnectionState::Idle,
                ..
            }
        ));
        assert!(matches!(connection.pause(), Err(Error::InvalidState { .. })));
    }

    #[tokio::test]
    async fn test_responses_resolve_out_of_order() {
        let (connection, _acceptor, mut peer) = open(quiet()).await;

        let second = tokio::spawn({
            let connection = connection.clone();
            async move {
                connection
                    .send_request(CommandKind::Conv, Operation::Query, json!({"q": 2}))
                    .await
            }
        });
        let third = tokio::spawn({
            let connection = connection.clone();
            async move {
                connection
                    .send_request(CommandKind::Conv, Operation::Query, json!({"q": 3}))
                    .await
            }
        });

        let a = peer.recv_command().await.expect("request");
        let b = peer.recv_command().await.expect("request");
        let mut ids = [a.request_id, b.request_id];
        ids.sort();
        assert_eq!(ids, [Some(RequestId::new(2)), Some(RequestId::new(3))]);

        let (later, earlier) = if a.request_id == Some(RequestId::new(3)) {
            (a, b)
        } else {
            (b, a)
        };
        peer.reply(&later, Operation::QueryResult, json!({"answer": later.get_i64("q")}));
        peer.reply(&earlier, Operation::QueryResult, json!({"answer": earlier.get_i64("q")}));

        let second = second.await.expect("join").expect("response");
        let third = third.await.expect("join").expect("response");
        assert_eq!(second.get_i64("answer"), 2);
        assert_eq!(third.get_i64("answer"), 3);
        assert_eq!(connection.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_server_error_fails_only_matching_request() {
        let (connection, _acceptor, mut peer) = open(quiet()).await;

        let (failing, succeeding, ()) = tokio::join!(
            connection.send_request(CommandKind::Conv, Operation::Query, json!({"q": "bad"})),
            connection.send_request(CommandKind::Conv, Operation::Query, json!({"q": "good"})),
            async {
                for _ in 0..2 {
                    let request = peer.recv_command().await.expect("request");
                    if request.get_str("q") == "bad" {
                        let reply = Command::bare(CommandKind::Conv)
                            .with_request_id(request.request_id.expect("id"))
                            .with_error(ErrorInfo::new(4301, "conversation not found"));
                        peer.send_command(&reply);
                    } else {
                        peer.reply(&request, Operation::QueryResult, json!({"ok": true}));
                    }
                }
            }
        );

        assert!(matches!(failing, Err(Error::Server { code: 4301, .. })));
        assert!(succeeding.expect("ok").body["ok"].as_bool().unwrap_or_default());
        assert_eq!(connection.state(), ConnectionState::Open);
    }

    #[tokio::test]
    async fn test_send_command_carries_no_request_id() {
        let (connection, _acceptor, mut peer) = open(quiet()).await;

        connection
            .send_command(CommandKind::Ack, Operation::Add, json!({"mid": "m1"}))
            .await
            .expect("send");

        let command = peer.recv_command().await.expect("command");
        assert_eq!(command.kind, CommandKind::Ack);
        assert!(command.request_id.is_none());
        assert_eq!(connection.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_timeout_removes_request() {
        let (connection, acceptor, peer) =
            open(quiet().with_send_timeout(Duration::from_secs(1))).await;
        acceptor.stall_sends(true);

        let err = connection
            .send_request(CommandKind::Conv, Operation::Query, json!({}))
            .await
            .expect_err("stalled");

        assert!(matches!(
            err,
            Error::RequestTimeout {
                request_id,
                timeout_ms: 1000
            } if request_id == RequestId::new(2)
        ));
        assert_eq!(connection.pending_count(), 0);

        let late = Command::new(CommandKind::Conv, Operation::QueryResult, json!({}))
            .with_request_id(RequestId::new(2));
        peer.send_command(&late);
        time::sleep(Duration::from_millis(10)).await;

        assert_eq!(connection.pending_count(), 0);
        assert_eq!(connection.state(), ConnectionState::Open);
    }

    #[tokio::test]
    async fn test_identical_requests_are_coalesced() {
        let (connection, _acceptor, mut peer) = open(quiet().with_coalescing()).await;

        let (first, second, ()) = tokio::join!(
            connection.send_request(CommandKind::Conv, Operation::Query, json!({"cid": "c1"})),
            connection.send_request(CommandKind::Conv, Operation::Query, json!({"cid": "c1"})),
            async {
                let request = peer.recv_command().await.expect("request");
                peer.reply(&request, Operation::QueryResult, json!({"n": 5}));
            }
        );

        assert_eq!(first.expect("first").get_i64("n"), 5);
        assert_eq!(second.expect("second").get_i64("n"), 5);

        round_trip(&connection, &mut peer).await;
        assert_eq!(connection.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_malformed_frame_is_discarded() {
        let (connection, _acceptor, mut peer) = open(quiet()).await;

        peer.send(b"not json".to_vec());
        peer.send(br#"{"cmd":"unknown-kind"}"#.to_vec());
        round_trip(&connection, &mut peer).await;

        assert_eq!(connection.state(), ConnectionState::Open);
    }

    // ------------------------------------------------------------------------
    // Notifications
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_pause_preserves_notification_order() {
        let (connection, _acceptor, mut peer) = open(quiet()).await;
        let seen = record_notifications(&connection);

        connection.pause().expect("pause");
        assert_eq!(connection.state(), ConnectionState::Paused);

        peer.send_command(&notification(1));
        peer.send_command(&notification(2));
        round_trip(&connection, &mut peer).await;

        assert!(seen.lock().is_empty());
        assert_eq!(connection.buffered_notifications(), 2);

        connection.resume().expect("resume");
        peer.send_command(&notification(3));
        round_trip(&connection, &mut peer).await;

        assert_eq!(*seen.lock(), vec![1, 2, 3]);
        assert_eq!(connection.state(), ConnectionState::Open);
        assert_eq!(connection.buffered_notifications(), 0);
    }

    #[tokio::test]
    async fn test_handler_pause_and_resume_during_replay() {
        let (connection, _acceptor, mut peer) = open(quiet()).await;
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        let me = connection.clone();
        connection.set_notification_handler(move |command| {
            let n = command.get_i64("n");
            sink.lock().push(n);
            if n == 1 {
                me.pause().expect("pause");
                me.resume().expect("resume");
            }
        });

        connection.pause().expect("pause");
        peer.send_command(&notification(1));
        peer.send_command(&notification(2));
        round_trip(&connection, &mut peer).await;

        connection.resume().expect("resume");
        peer.send_command(&notification(3));
        round_trip(&connection, &mut peer).await;
        connection.resume().expect("resume again");

        assert_eq!(*seen.lock(), vec![1, 2, 3]);
        assert_eq!(connection.state(), ConnectionState::Open);
        assert_eq!(connection.buffered_notifications(), 0);

        connection.clear_notification_handler();
    }

    // ------------------------------------------------------------------------
    // Closure
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_transport_loss_fails_pending_requests() {
        let (connection, _acceptor, mut peer) = open(quiet()).await;
        let events = record_events(&connection);

        let requests: Vec<_> = (0..3)
            .map(|n| {
                let connection = connection.clone();
                tokio::spawn(async move {
                    connection
                        .send_request(CommandKind::Conv, Operation::Query, json!({"n": n}))
                        .await
                })
            })
            .collect();

        for _ in 0..3 {
            peer.recv_command().await.expect("request");
        }
        assert_eq!(connection.pending_count(), 3);

        peer.close(4000, "bye");

        for request in requests {
            let result = request.await.expect("join");
            assert!(matches!(result, Err(Error::ConnectionReset)));
        }
        assert_eq!(connection.pending_count(), 0);
        assert_eq!(connection.state(), ConnectionState::Closed);
        assert_eq!(
            *events.lock(),
            vec![ConnectionEvent::Disconnected {
                code: 4000,
                reason: "bye".into()
            }]
        );

        let err = connection
            .send_request(CommandKind::Conv, Operation::Query, json!({}))
            .await
            .expect_err("closed");
        assert!(matches!(err, Error::ConnectionClosed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_fails_request_stuck_in_writer_at_once() {
        let (connection, acceptor, _peer) = open(quiet()).await;
        acceptor.stall_sends(true);

        let request = {
            let connection = connection.clone();
            tokio::spawn(async move {
                connection
                    .send_request(CommandKind::Conv, Operation::Query, json!({}))
                    .await
            })
        };
        wait_for(|| connection.pending_count() == 1).await;

        let started = time::Instant::now();
        let closing = {
            let connection = connection.clone();
            tokio::spawn(async move { connection.close().await })
        };

        let result = request.await.expect("join");
        assert!(matches!(result, Err(Error::ConnectionReset)));
        assert!(started.elapsed() < CLOSE_GRACE);
        assert_eq!(connection.pending_count(), 0);

        closing.await.expect("join").expect("close");
        assert_eq!(connection.state(), ConnectionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_heartbeat_closes_once() {
        let options = quiet().with_heartbeat(HeartbeatOptions::every(Duration::from_secs(5)));
        let (connection, _acceptor, mut peer) = open(options).await;
        let events = record_events(&connection);

        let probe = peer.recv_command().await.expect("probe");
        assert_eq!(probe.kind, CommandKind::Echo);

        time::sleep(Duration::from_secs(6)).await;
        assert_eq!(connection.state(), ConnectionState::Closed);

        time::sleep(Duration::from_secs(30)).await;
        assert_eq!(
            *events.lock(),
            vec![ConnectionEvent::Disconnected {
                code: CLOSE_HEARTBEAT_TIMEOUT,
                reason: "heartbeat timeout".into()
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_answered_heartbeat_keeps_connection_open() {
        let options = quiet().with_heartbeat(HeartbeatOptions::every(Duration::from_secs(5)));
        let (connection, _acceptor, mut peer) = open(options).await;

        for _ in 0..4 {
            let probe = peer.recv_command().await.expect("probe");
            assert_eq!(probe.kind, CommandKind::Echo);
            peer.send_command(&Command::bare(CommandKind::Echo));
        }

        assert_eq!(connection.state(), ConnectionState::Open);
    }

    #[tokio::test]
    async fn test_server_close_forces_disconnect() {
        let (connection, _acceptor, peer) = open(quiet()).await;
        let events = record_events(&connection);

        peer.send_command(&Command::new(
            CommandKind::Conn,
            Operation::Closed,
            json!({"reason": "kicked"}),
        ));

        wait_for(|| connection.state() == ConnectionState::Closed).await;
        assert_eq!(
            *events.lock(),
            vec![ConnectionEvent::Disconnected {
                code: CLOSE_BY_SERVER,
                reason: "kicked".into()
            }]
        );
    }

    #[tokio::test]
    async fn test_close_sends_close_command() {
        let options = quiet().with_close_command(CommandKind::Conn, Operation::Close);
        let (connection, _acceptor, mut peer) = open(options).await;
        let events = record_events(&connection);

        connection.close().await.expect("close");

        let command = peer.recv_command().await.expect("close command");
        assert!(command.is(CommandKind::Conn, Operation::Close));
        assert_eq!(peer.recv().await, None);

        assert_eq!(connection.state(), ConnectionState::Closed);
        assert!(events.lock().is_empty());
        assert!(matches!(
            connection.send_command(CommandKind::Ack, Operation::Add, json!({})).await,
            Err(Error::ConnectionClosed)
        ));

        connection.close().await.expect("idempotent");
    }

    // ------------------------------------------------------------------------
    // Reopen
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_reopen_resumes_session() {
        let (connection, mut acceptor, peer) = open(quiet()).await;
        let events = record_events(&connection);

        peer.close(1006, "network");
        wait_for(|| connection.state() == ConnectionState::Closed).await;

        let (outcome, _peer) = tokio::join!(connection.reopen(), async {
            let mut peer = acceptor.accept().await.expect("peer");
            let open = peer.recv_command().await.expect("open");
            assert_eq!(open.body["r"], true);
            assert_eq!(open.get_str("st"), STANDARD.encode(b"token-1"));
            peer.reply(&open, Operation::Opened, json!({"st": STANDARD.encode(b"token-2")}));
            peer
        });

        assert_eq!(outcome.expect("reopen"), OpenOutcome::Resumed);
        assert_eq!(connection.state(), ConnectionState::Open);
        assert_eq!(connection.credential().expect("credential").token(), b"token-2");
        assert_eq!(
            *events.lock(),
            vec![
                ConnectionEvent::Disconnected {
                    code: 1006,
                    reason: "network".into()
                },
                ConnectionEvent::Resumed
            ]
        );
    }

    #[tokio::test]
    async fn test_reopen_rejected_reports_session_closed() {
        let (connection, mut acceptor, peer) = open(quiet()).await;
        let events = record_events(&connection);

        drop(peer);
        wait_for(|| connection.state() == ConnectionState::Closed).await;

        let (outcome, _peer) = tokio::join!(connection.reopen(), async {
            let mut peer = acceptor.accept().await.expect("peer");
            let open = peer.recv_command().await.expect("open");
            peer.reply(
                &open,
                Operation::Closed,
                json!({"code": 4112, "reason": "session expired"}),
            );
            peer
        });

        assert_eq!(
            outcome.expect("reopen"),
            OpenOutcome::SessionLost {
                code: 4112,
                reason: "session expired".into()
            }
        );
        assert_eq!(connection.state(), ConnectionState::Open);
        assert!(connection.credential().is_none());
        assert!(events.lock().contains(&ConnectionEvent::SessionClosed {
            code: 4112,
            reason: "session expired".into()
        }));
    }

    #[tokio::test]
    async fn test_expired_credential_is_not_offered() {
        let (connection, mut acceptor, peer) = open(quiet()).await;
        connection.set_credential(Some(SessionCredential::with_ttl(
            b"old".to_vec(),
            Duration::ZERO,
        )));

        drop(peer);
        wait_for(|| connection.state() == ConnectionState::Closed).await;

        let (outcome, _peer) = tokio::join!(connection.reopen(), async {
            let mut peer = acceptor.accept().await.expect("peer");
            let open = peer.recv_command().await.expect("open");
            assert!(open.body.get("st").is_none());
            peer.reply(&open, Operation::Opened, json!({}));
            peer
        });

        assert_eq!(outcome.expect("reopen"), OpenOutcome::Resumed);
    }

    #[tokio::test]
    async fn test_goaway_triggers_automatic_reconnect() {
        let options =
            quiet().with_reconnect(ReconnectPolicy::attempts(3, Duration::from_millis(20)));
        let (connection, mut acceptor, peer) = open(options).await;
        let events = record_events(&connection);

        peer.send_command(&Command::bare(CommandKind::Goaway));

        let mut next = acceptor.accept().await.expect("reconnect");
        let open = next.recv_command().await.expect("open");
        assert_eq!(open.body["r"], true);
        next.reply(&open, Operation::Opened, json!({}));

        wait_for(|| connection.state() == ConnectionState::Open).await;
        wait_for(|| events.lock().len() == 3).await;
        assert_eq!(
            *events.lock(),
            vec![
                ConnectionEvent::Disconnected {
                    code: CLOSE_GOAWAY,
                    reason: "goaway".into()
                },
                ConnectionEvent::Reconnecting { attempt: 1 },
                ConnectionEvent::Resumed
            ]
        );
    }

    #[tokio::test]
    async fn test_reconnect_gives_up_after_max_attempts() {
        let options =
            quiet().with_reconnect(ReconnectPolicy::attempts(2, Duration::from_millis(5)));
        let (connection, acceptor, peer) = open(options).await;
        let events = record_events(&connection);
        acceptor.refuse_next(10);

        peer.close(1006, "network");

        wait_for(|| {
            events
                .lock()
                .contains(&ConnectionEvent::ReconnectFailed { attempts: 2 })
        })
        .await;
        assert_eq!(
            *events.lock(),
            vec![
                ConnectionEvent::Disconnected {
                    code: 1006,
                    reason: "network".into()
                },
                ConnectionEvent::Reconnecting { attempt: 1 },
                ConnectionEvent::Reconnecting { attempt: 2 },
                ConnectionEvent::ReconnectFailed { attempts: 2 }
            ]
        );
        assert_eq!(connection.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_close_stops_automatic_reconnect() {
        let options =
            quiet().with_reconnect(ReconnectPolicy::forever(Duration::from_millis(50)));
        let (connection, mut acceptor, peer) = open(options).await;

        peer.close(1006, "network");
        wait_for(|| connection.state() == ConnectionState::Closed).await;
        connection.close().await.expect("close");

        time::sleep(Duration::from_millis(150)).await;
        assert!(acceptor.try_accept().is_none());
        assert_eq!(connection.state(), ConnectionState::Closed);
    }
}
