//! Inbound port: the surface the node runtime and the transport drive.

use async_trait::async_trait;
use shared_types::{AccessKind, ContextName, Envelope, NodeAddr, OrderId, ProtocolMessage};

use crate::domain::errors::CoordinationError;

/// The operations the outside world invokes on the coordination core.
#[async_trait]
pub trait CoordinationApi: Send + Sync {
    /// Start hosting a context on this node. Returns its numeric id.
    async fn host_context(
        &self,
        name: &str,
        type_name: &str,
    ) -> Result<u32, CoordinationError>;

    /// Submit a fresh application event: sells a create ticket in
    /// `create_context` and routes the event toward `target_context`.
    async fn submit_event(
        &self,
        create_context: &str,
        target_context: &str,
        access: AccessKind,
        method: &str,
        payload: Vec<u8>,
    ) -> Result<OrderId, CoordinationError>;

    /// Deliver a protocol message from the wire.
    async fn receive(
        &self,
        envelope: Envelope<ProtocolMessage>,
    ) -> Result<(), CoordinationError>;

    /// Relocate a context's live state to another node.
    async fn migrate_context(
        &self,
        context: &ContextName,
        dest: NodeAddr,
    ) -> Result<(), CoordinationError>;
}
