//! Wire protocol types.
//!
//! This module defines the command envelope exchanged with the backend,
//! the codec that turns it into frames, and the inbound routing table.
//!
//! # Protocol Overview
//!
//! | Message | Direction | Has `i` |
//! |---------|-----------|---------|
//! | Request | Local → Remote | yes |
//! | Response | Remote → Local | yes (same as request) |
//! | Command | Local → Remote | no (fire-and-forget, probes) |
//! | Notification | Remote → Local | no |
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `command` | [`Command`] envelope, kinds and operations |
//! | `codec` | [`FrameCodec`] trait and [`JsonCodec`] |
//! | `route` | Exhaustive `(kind, op)` classification |

// ============================================================================
// Submodules
// ============================================================================

/// Command envelope.
pub mod command;

/// Frame codec.
pub mod codec;

/// Inbound routing table.
pub mod route;

// ============================================================================
// Re-exports
// ============================================================================

pub use codec::{FrameCodec, JsonCodec};
pub use command::{Command, CommandKind, ErrorInfo, Operation};
pub use route::{Inbound, classify, is_idempotent};
