//! Errors shared across the coordination crates.
//!
//! Only caller-facing misuse surfaces as a typed error. Internal protocol
//! invariant violations are bugs in the coordination logic itself and panic
//! at the point of detection.

use crate::entities::OrderId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Envelope from a different protocol generation.
    #[error("protocol version mismatch: expected {expected}, got {got}")]
    VersionMismatch { expected: u16, got: u16 },

    /// Message addressed to a context this node does not host.
    #[error("unknown context: {0}")]
    UnknownContext(String),

    /// Message referring to an event with no local state.
    #[error("unknown event: {0}")]
    UnknownEvent(OrderId),

    /// An event was committed twice in the same context.
    #[error("event {0} already committed")]
    DuplicateCommit(OrderId),

    /// Undecodable payload (state blob, params).
    #[error("payload decode failed: {0}")]
    Decode(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ProtocolError::UnknownContext("Router".into());
        assert_eq!(err.to_string(), "unknown context: Router");

        let err = ProtocolError::DuplicateCommit(OrderId::new(3, 9));
        assert_eq!(err.to_string(), "event 3:9 already committed");
    }
}
