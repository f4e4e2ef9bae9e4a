//! Error types for the coordination core.
//!
//! Boundary misuse (unknown names, double commits, draining contexts) is
//! reported as a typed error. Ordering and queue-consistency violations are
//! bugs in the protocol itself and panic where detected; they must never be
//! swallowed or retried.

use shared_types::{OrderId, ProtocolError};
use thiserror::Error;

/// All caller-facing errors of the coordination core.
#[derive(Debug, Error)]
pub enum CoordinationError {
    /// The named context is not hosted on this node.
    #[error("unknown context: {0}")]
    UnknownContext(String),

    /// The event has no execution state in the addressed context.
    #[error("unknown event {event} in context {context}")]
    UnknownEvent { event: OrderId, context: String },

    /// An event was committed twice in the same context.
    #[error("event {0} already committed")]
    DuplicateCommit(OrderId),

    /// The context is draining for migration and admits no new work.
    #[error("context {0} is migrating")]
    Migrating(String),

    /// A commit was enqueued for an event that never obtained an execute
    /// ticket here.
    #[error("event {0} holds no execute ticket")]
    NoExecuteTicket(OrderId),

    /// The dispatch pools have shut down.
    #[error("dispatch pools stopped")]
    DispatchStopped,

    /// Transport-level failure reported by the message sender.
    #[error("transport: {0}")]
    Transport(String),

    /// Envelope / payload validation failure.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CoordinationError::UnknownEvent {
            event: OrderId::new(1, 7),
            context: "Root.A".into(),
        };
        assert_eq!(err.to_string(), "unknown event 1:7 in context Root.A");
    }
}
