//! Command envelope.
//!
//! Every frame on the wire decodes to one [`Command`]. The pair
//! `(kind, op)` names the logical operation, the optional request id
//! correlates requests with responses, and the body is opaque to the
//! connection.
//!
//! # Kinds
//!
//! | Kind | Used for |
//! |------|----------|
//! | `session` | Session open/close/refresh handshake |
//! | `conv` | Conversation and room operations |
//! | `direct`, `ack`, `rcp`, `unread`, `patch` | Messaging |
//! | `events` | Custom room events |
//! | `echo` | Heartbeat probe and reply |
//! | `goaway` | Server asks the client to move to a new transport |
//! | `conn` | Connection-level close |

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::identifiers::RequestId;

// ============================================================================
// CommandKind
// ============================================================================

/// Top-level command category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandKind {
    /// Session lifecycle.
    Session,
    /// Conversations and rooms.
    Conv,
    /// Direct message.
    Direct,
    /// Message acknowledgement.
    Ack,
    /// Read receipt.
    Rcp,
    /// Unread counters.
    Unread,
    /// Message patch (edit/recall).
    Patch,
    /// Custom events.
    Events,
    /// Heartbeat probe.
    Echo,
    /// Server-initiated transport migration.
    Goaway,
    /// Connection-level control.
    Conn,
}

impl CommandKind {
    /// Returns the wire name of the kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Session => "session",
            Self::Conv => "conv",
            Self::Direct => "direct",
            Self::Ack => "ack",
            Self::Rcp => "rcp",
            Self::Unread => "unread",
            Self::Patch => "patch",
            Self::Events => "events",
            Self::Echo => "echo",
            Self::Goaway => "goaway",
            Self::Conn => "conn",
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Operation
// ============================================================================

/// Operation within a [`CommandKind`].
///
/// Requests use the imperative form (`open`), replies and pushes the
/// past form (`opened`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Operation {
    /// Open a session or room.
    Open,
    /// Session or room opened.
    Opened,
    /// Close a session or connection.
    Close,
    /// Session or connection closed by the server.
    Closed,
    /// Refresh the session credential.
    Refresh,
    /// Credential refreshed.
    Refreshed,
    /// Create a conversation.
    Start,
    /// Conversation created.
    Started,
    /// Add members.
    Add,
    /// Members added.
    Added,
    /// Remove members.
    Remove,
    /// Members removed.
    Removed,
    /// Update attributes.
    Update,
    /// Attributes updated.
    Updated,
    /// Member list query or push.
    Members,
    /// Someone joined.
    Joined,
    /// Someone left.
    Left,
    /// Query records.
    Query,
    /// Query reply.
    QueryResult,
}

impl Operation {
    /// Returns the wire name of the operation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Opened => "opened",
            Self::Close => "close",
            Self::Closed => "closed",
            Self::Refresh => "refresh",
            Self::Refreshed => "refreshed",
            Self::Start => "start",
            Self::Started => "started",
            Self::Add => "add",
            Self::Added => "added",
            Self::Remove => "remove",
            Self::Removed => "removed",
            Self::Update => "update",
            Self::Updated => "updated",
            Self::Members => "members",
            Self::Joined => "joined",
            Self::Left => "left",
            Self::Query => "query",
            Self::QueryResult => "query-result",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// ErrorInfo
// ============================================================================

/// Error object carried by a failed response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorInfo {
    /// Server error code.
    pub code: i32,

    /// Human readable detail.
    #[serde(default)]
    pub detail: String,

    /// Application-level code (optional).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_code: Option<i32>,

    /// Application-level message (optional).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_message: Option<String>,
}

impl ErrorInfo {
    /// Creates an error object with code and detail.
    #[inline]
    #[must_use]
    pub fn new(code: i32, detail: impl Into<String>) -> Self {
        Self {
            code,
            detail: detail.into(),
            app_code: None,
            app_message: None,
        }
    }
}

impl From<ErrorInfo> for Error {
    fn from(info: ErrorInfo) -> Self {
        Self::Server {
            code: info.code,
            detail: info.detail,
            app_code: info.app_code,
            app_message: info.app_message,
        }
    }
}

// ============================================================================
// Command
// ============================================================================

/// The decoded unit of wire data.
///
/// # Format
///
/// ```json
/// {
///   "cmd": "session",
///   "op": "open",
///   "i": 1,
///   "body": { ... },
///   "error": { "code": 4102, "detail": "..." }
/// }
/// ```
///
/// `i` is present on requests and their responses only; a command without
/// it is a push notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Command category.
    #[serde(rename = "cmd")]
    pub kind: CommandKind,

    /// Operation within the category.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub op: Option<Operation>,

    /// Correlation id.
    #[serde(rename = "i", default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,

    /// Opaque payload.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub body: Value,

    /// Error object (responses only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

impl Command {
    /// Creates a command with an operation and body.
    #[inline]
    #[must_use]
    pub fn new(kind: CommandKind, op: Operation, body: Value) -> Self {
        Self {
            kind,
            op: Some(op),
            request_id: None,
            body,
            error: None,
        }
    }

    /// Creates a command carrying only its kind (e.g. a heartbeat probe).
    #[inline]
    #[must_use]
    pub fn bare(kind: CommandKind) -> Self {
        Self {
            kind,
            op: None,
            request_id: None,
            body: Value::Null,
            error: None,
        }
    }

    /// Sets the request id.
    #[inline]
    #[must_use]
    pub fn with_request_id(mut self, id: RequestId) -> Self {
        self.request_id = Some(id);
        self
    }

    /// Sets the error object.
    #[inline]
    #[must_use]
    pub fn with_error(mut self, error: ErrorInfo) -> Self {
        self.error = Some(error);
        self
    }

    /// Returns `true` if this command is a request or response.
    #[inline]
    #[must_use]
    pub fn is_correlated(&self) -> bool {
        self.request_id.is_some()
    }

    /// Returns `true` if this command matches `(kind, op)`.
    #[inline]
    #[must_use]
    pub fn is(&self, kind: CommandKind, op: Operation) -> bool {
        self.kind == kind && self.op == Some(op)
    }

    /// Converts a response into its payload, failing on an error object.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Server`] if the response carries an error.
    pub fn into_result(self) -> Result<Self> {
        match self.error {
            Some(info) => Err(info.into()),
            None => Ok(self),
        }
    }

    /// Identity of the request ignoring its id.
    ///
    /// Two in-flight requests with the same fingerprint ask the server the
    /// same question.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let op = self.op.map(Operation::as_str).unwrap_or_default();
        format!("{}/{}:{}", self.kind, op, self.body)
    }

    /// Gets a string value from the body.
    ///
    /// Returns empty string if key not found or not a string.
    #[inline]
    #[must_use]
    pub fn get_str(&self, key: &str) -> &str {
        self.body.get(key).and_then(Value::as_str).unwrap_or_default()
    }

    /// Gets an i64 value from the body.
    ///
    /// Returns 0 if key not found or not a number.
    #[inline]
    #[must_use]
    pub fn get_i64(&self, key: &str) -> i64 {
        self.body.get(key).and_then(Value::as_i64).unwrap_or_default()
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(op) = self.op {
            write!(f, "/{op}")?;
        }
        if let Some(id) = self.request_id {
            write!(f, " {id}")?;
        }
        if let Some(error) = &self.error {
            write!(f, " error={}", error.code)?;
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
