//! Inbound routing table.
//!
//! Every decoded inbound command is classified exactly once by
//! [`classify`]; the connection's receive loop acts on the result.
//!
//! | Match | Route |
//! |-------|-------|
//! | any command with a request id | [`Inbound::Response`] |
//! | `echo` | [`Inbound::Pong`] |
//! | `goaway` | [`Inbound::Goaway`] |
//! | `conn/closed` | [`Inbound::ServerClose`] |
//! | everything else | [`Inbound::Notification`] |

// ============================================================================
// Imports
// ============================================================================

use crate::identifiers::RequestId;

use super::{Command, CommandKind, Operation};

// ============================================================================
// Inbound
// ============================================================================

/// Where an inbound command goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inbound {
    /// Response to an outstanding request.
    Response(RequestId),
    /// Heartbeat reply.
    Pong,
    /// The server asks the client to reconnect elsewhere.
    Goaway,
    /// The server closed the connection.
    ServerClose,
    /// Push notification for the application.
    Notification,
}

/// Classifies an inbound command.
#[must_use]
pub fn classify(command: &Command) -> Inbound {
    match (command.kind, command.op, command.request_id) {
        (_, _, Some(id)) => Inbound::Response(id),
        (CommandKind::Echo, _, None) => Inbound::Pong,
        (CommandKind::Goaway, _, None) => Inbound::Goaway,
        (CommandKind::Conn, Some(Operation::Closed), None) => Inbound::ServerClose,
        (
            CommandKind::Session
            | CommandKind::Conv
            | CommandKind::Direct
            | CommandKind::Ack
            | CommandKind::Rcp
            | CommandKind::Unread
            | CommandKind::Patch
            | CommandKind::Events
            | CommandKind::Conn,
            _,
            None,
        ) => Inbound::Notification,
    }
}

/// Returns `true` if repeating `(kind, op)` has no additional effect.
///
/// Only idempotent requests may be coalesced with an identical in-flight
/// request.
#[must_use]
pub fn is_idempotent(kind: CommandKind, op: Option<Operation>) -> bool {
    !matches!(
        (kind, op),
        (CommandKind::Direct, _)
            | (CommandKind::Session, Some(Operation::Open))
            | (
                CommandKind::Conv,
                Some(Operation::Start | Operation::Update | Operation::Members)
            )
    )
}

// ============================================================================
// Tests
// ============================================================================
