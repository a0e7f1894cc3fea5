//! Frame codec.
//!
//! Converts [`Command`] envelopes to and from transport frames. The
//! connection only depends on the [`FrameCodec`] trait, so a binary schema
//! can replace the default [`JsonCodec`] without touching the state machine.

// ============================================================================
// Imports
// ============================================================================

use crate::error::{Error, Result};

use super::Command;

// ============================================================================
// FrameCodec
// ============================================================================

/// Encodes and decodes command envelopes.
pub trait FrameCodec: Send + Sync + 'static {
    /// Encodes a command into one frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the command cannot be represented.
    fn encode(&self, command: &Command) -> Result<Vec<u8>>;

    /// Decodes one frame into a command.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is not a valid envelope.
    fn decode(&self, frame: &[u8]) -> Result<Command>;
}

// ============================================================================
// JsonCodec
// ============================================================================

/// JSON envelope codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl FrameCodec for JsonCodec {
    fn encode(&self, command: &Command) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(command)?)
    }

    fn decode(&self, frame: &[u8]) -> Result<Command> {
        if frame.is_empty() {
            return Err(Error::protocol("empty frame"));
        }
        Ok(serde_json::from_slice(frame)?)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use proptest::prelude::*;
    use serde_json::json;

    use crate::identifiers::RequestId;
    use crate::protocol::{CommandKind, ErrorInfo, Operation};

    #[test]
    fn test_encode_decode_response_with_error() {
        let codec = JsonCodec;
        let command = Command::new(CommandKind::Conv, Operation::Updated, json!({"x": 1}))
            .with_request_id(RequestId::new(5))
            .with_error(ErrorInfo::new(4000, "nope"));

        let frame = codec.encode(&command).expect("encode");
        let decoded = codec.decode(&frame).expect("decode");
        assert_eq!(decoded, command);
    }

    #[test]
    fn test_decode_rejects_empty_frame() {
        let err = JsonCodec.decode(&[]).expect_err("empty frame");
        assert!(matches!(err, Error::Protocol { .. }));
    }

    #[test]
    fn test_decode_rejects_unknown_kind() {
        let err = JsonCodec
            .decode(br#"{"cmd":"teleport"}"#)
            .expect_err("unknown kind");
        assert!(matches!(err, Error::Json(_)));
    }

    proptest! {
        #[test]
        fn decode_never_panics_on_garbage(bytes in proptest::collection::vec(any::<u8>(), 0..256)) {
            let _ = JsonCodec.decode(&bytes);
        }
    }
}
