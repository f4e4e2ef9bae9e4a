//! Wire-facing entry point for coordination traffic.
//!
//! Validates envelopes before any payload is interpreted and converts
//! handler failures into log lines: a malformed or misrouted message must
//! never take the node down.

use crate::application::service::ContextCoordinationService;
use crate::domain::errors::CoordinationError;
use crate::ports::inbound::CoordinationApi;
use shared_types::{Envelope, ProtocolMessage};
use std::sync::Arc;
use tracing::{debug, error};

pub struct CoordinationHandler {
    service: Arc<ContextCoordinationService>,
}

impl CoordinationHandler {
    pub fn new(service: Arc<ContextCoordinationService>) -> Self {
        Self { service }
    }

    /// Handle one decoded envelope from the transport.
    pub async fn handle(&self, envelope: Envelope<ProtocolMessage>) -> Result<(), CoordinationError> {
        envelope.check_version()?;
        debug!(sender = %envelope.sender, "coordination message received");
        match self.service.receive(envelope).await {
            Ok(()) => Ok(()),
            Err(err @ CoordinationError::UnknownContext(_)) => {
                // Misrouted traffic is the sender's bug; log and drop.
                error!(%err, "message for a context not hosted here");
                Err(err)
            }
            Err(err) => {
                error!(%err, "coordination message failed");
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{InMemoryMapping, OwnershipTree};
    use crate::config::CoordinationConfig;
    use crate::ports::outbound::mocks::{RecordingSender, RecordingUpcall};
    use shared_types::{NodeAddr, OrderId, PROTOCOL_VERSION};

    fn service() -> Arc<ContextCoordinationService> {
        let node = NodeAddr::new("n1");
        ContextCoordinationService::new(
            CoordinationConfig::default(),
            node.clone(),
            Arc::new(OwnershipTree::new("Root")),
            Arc::new(InMemoryMapping::new(node)),
            Arc::new(RecordingSender::default()),
            Arc::new(RecordingUpcall::default()),
        )
    }

    #[tokio::test]
    async fn test_version_mismatch_rejected_before_dispatch() {
        let handler = CoordinationHandler::new(service());
        let mut envelope = Envelope::new(
            NodeAddr::new("n2"),
            ProtocolMessage::ReleaseLockOnContext {
                dest_context: "Root".into(),
                src_context: "Root".into(),
                event_id: OrderId::new(1, 1),
            },
        );
        envelope.version = PROTOCOL_VERSION + 1;
        assert!(handler.handle(envelope).await.is_err());
    }

    #[tokio::test]
    async fn test_unknown_context_reported() {
        let handler = CoordinationHandler::new(service());
        let envelope = Envelope::new(
            NodeAddr::new("n2"),
            ProtocolMessage::CommitDone {
                dest_context: "Nowhere".into(),
                src_context: "Root".into(),
                event_id: OrderId::new(1, 1),
                executed_contexts: Default::default(),
            },
        );
        assert!(matches!(
            handler.handle(envelope).await,
            Err(CoordinationError::UnknownContext(_))
        ));
    }
}
