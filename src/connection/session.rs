//! Session-open handshake.
//!
//! After every transport connect the connection performs one request/response
//! exchange built by a [`Handshake`]. A fresh connect sends the open command
//! with `rejoin = false`; a reopen sends it with `rejoin = true` and the
//! credential the server issued last time, so the server can reattach the
//! previous session.
//!
//! [`SessionHandshake`] speaks the `session/open` dialect:
//!
//! ```text
//! => {"cmd":"session","op":"open","i":1,"body":{"appId":"..","peerId":"..","r":true,"st":"<base64>"}}
//! <= {"cmd":"session","op":"opened","i":1,"body":{"st":"<base64>","stTtl":3600}}
//! <= {"cmd":"session","op":"closed","i":1,"body":{"code":4112,"reason":"session expired"}}
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::time::{Duration, Instant};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::{Map, Value, json};

use crate::error::{Error, Result};
use crate::protocol::{Command, CommandKind, Operation};

// ============================================================================
// SessionCredential
// ============================================================================

/// Opaque token issued by the server when a session opens.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionCredential {
    token: Vec<u8>,
    expires_at: Option<Instant>,
}

impl SessionCredential {
    /// Creates a credential that never expires.
    #[inline]
    #[must_use]
    pub fn new(token: impl Into<Vec<u8>>) -> Self {
        Self {
            token: token.into(),
            expires_at: None,
        }
    }

    /// Creates a credential valid for `ttl` from now.
    #[must_use]
    pub fn with_ttl(token: impl Into<Vec<u8>>, ttl: Duration) -> Self {
        Self {
            token: token.into(),
            expires_at: Instant::now().checked_add(ttl),
        }
    }

    /// Raw token bytes.
    #[inline]
    #[must_use]
    pub fn token(&self) -> &[u8] {
        &self.token
    }

    /// Expiry, if the server gave one.
    #[inline]
    #[must_use]
    pub const fn expires_at(&self) -> Option<Instant> {
        self.expires_at
    }

    /// Returns `true` once the TTL has elapsed.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

impl fmt::Debug for SessionCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCredential")
            .field("token", &format_args!("<{} bytes>", self.token.len()))
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

// ============================================================================
// Handshake
// ============================================================================

/// Interpreted handshake reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeOutcome {
    /// The session is open. A new credential replaces the stored one.
    Opened {
        /// Credential issued by the server, if any.
        credential: Option<SessionCredential>,
    },
    /// The server refused the session.
    Rejected {
        /// Server-provided code.
        code: i32,
        /// Server-provided reason.
        reason: String,
    },
}

/// Builds and interprets the session-open exchange.
pub trait Handshake: Send + Sync + 'static {
    /// Builds the open command.
    ///
    /// `credential` is the unexpired credential from the previous session,
    /// offered on reopen only.
    fn open_command(&self, rejoin: bool, credential: Option<&SessionCredential>) -> Command;

    /// Interprets the server's reply.
    ///
    /// A reply carrying an error object never reaches this method; the
    /// connection treats it as a rejection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if the reply is not a handshake reply.
    fn interpret(&self, reply: &Command) -> Result<HandshakeOutcome>;
}

// ============================================================================
// SessionHandshake
// ============================================================================

/// `session/open` handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHandshake {
    app_id: String,
    peer_id: String,
    user_agent: Option<String>,
}

impl SessionHandshake {
    /// Creates a handshake for `peer_id` within `app_id`.
    #[must_use]
    pub fn new(app_id: impl Into<String>, peer_id: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            peer_id: peer_id.into(),
            user_agent: None,
        }
    }

    /// Sets the user agent reported to the server.
    #[must_use]
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }
}

impl Handshake for SessionHandshake {
    fn open_command(&self, rejoin: bool, credential: Option<&SessionCredential>) -> Command {
        let mut body = Map::new();
        body.insert("appId".into(), json!(self.app_id));
        body.insert("peerId".into(), json!(self.peer_id));
        if let Some(ua) = &self.user_agent {
            body.insert("ua".into(), json!(ua));
        }
        if rejoin {
            body.insert("r".into(), Value::Bool(true));
        }
        if let Some(credential) = credential {
            body.insert("st".into(), json!(STANDARD.encode(credential.token())));
        }

        Command::new(CommandKind::Session, Operation::Open, Value::Object(body))
    }

    fn interpret(&self, reply: &Command) -> Result<HandshakeOutcome> {
        if reply.is(CommandKind::Session, Operation::Opened) {
            let credential = match reply.body.get("st").and_then(Value::as_str) {
                Some(encoded) => {
                    let token = STANDARD
                        .decode(encoded)
                        .map_err(|e| Error::protocol(format!("Invalid session token: {e}")))?;
                    Some(match reply.body.get("stTtl").and_then(Value::as_u64) {
                        Some(ttl) => SessionCredential::with_ttl(token, Duration::from_secs(ttl)),
                        None => SessionCredential::new(token),
                    })
                }
                None => None,
            };
            return Ok(HandshakeOutcome::Opened { credential });
        }

        if reply.is(CommandKind::Session, Operation::Closed) {
            let code = i32::try_from(reply.get_i64("code")).unwrap_or_default();
            return Ok(HandshakeOutcome::Rejected {
                code,
                reason: reply.get_str("reason").to_string(),
            });
        }

        Err(Error::protocol(format!("Unexpected handshake reply: {reply}")))
    }
}

// ============================================================================
// Tests
// ============================================================================
