//! Outbound ports: the collaborators the coordination core depends on.
//!
//! The ownership structure and the context mapping are node-local replicas
//! consulted synchronously; the transport and the application runtime are
//! asynchronous.

use async_trait::async_trait;
use shared_types::{ContextName, Envelope, NodeAddr, OrderId, ProtocolMessage};
use std::collections::BTreeSet;

use crate::domain::errors::CoordinationError;

/// Read-only queries over the ownership DAG replica.
///
/// "Dominator" is the context currently designated to serialize access
/// requests for a region of the DAG (the nearest upper bound of the queried
/// context).
pub trait StructureView: Send + Sync {
    /// The dominator currently governing `ctx`, or `None` for unknown names.
    fn dominator_of(&self, ctx: &str) -> Option<ContextName>;

    /// Every context `ctx` currently dominates (itself included when it is a
    /// dominator).
    fn dominated_set_of(&self, ctx: &str) -> Vec<ContextName>;

    /// True when `ancestor` lies above `junior` in the DAG.
    fn is_elder_context(&self, ancestor: &str, junior: &str) -> bool;

    /// True when `ctx` is reachable from the root.
    fn connects_to_root(&self, ctx: &str) -> bool;

    /// True when `ctx` governs itself (it is its own dominator).
    fn is_dominator(&self, ctx: &str) -> bool {
        self.dominator_of(ctx).as_deref() == Some(ctx)
    }

    /// Per-node DAG version; 0 when the node is unknown here.
    fn dag_version(&self, ctx: &str) -> u64;

    /// Version of the whole replica.
    fn current_version(&self) -> u64;

    /// Ownership edges touching any of `contexts`.
    fn ownership_pairs_of(
        &self,
        contexts: &BTreeSet<ContextName>,
    ) -> Vec<(ContextName, ContextName)>;
}

/// Mutations of the ownership DAG replica.
pub trait StructureEdit: StructureView {
    /// View-only handle to the same replica (trait upcast).
    fn as_view(&self) -> &dyn StructureView;

    /// Apply add/remove edge operations atomically. Returns the set of
    /// contexts whose dominator may have changed.
    fn apply_ownership_changes(
        &self,
        changes: &[(bool, ContextName, ContextName)],
    ) -> BTreeSet<ContextName>;

    /// Merge ownership pairs (with their versions) received from another
    /// node. Existing fresher knowledge wins.
    fn update_ownership_pairs(
        &self,
        pairs: &[(ContextName, ContextName)],
        versions: &std::collections::BTreeMap<ContextName, u64>,
    );
}

/// Node placement lookups and updates.
pub trait MappingStore: Send + Sync {
    fn resolve(&self, ctx: &str) -> Option<NodeAddr>;
    fn head(&self) -> NodeAddr;
    fn has_context(&self, ctx: &str) -> bool;
    fn current_version(&self) -> u64;
    /// Hand out a fresh numeric context id.
    fn allocate_id(&self) -> u32;
    /// Record a context placement under a previously allocated id.
    fn place_at(&self, ctx: &str, id: u32, node: NodeAddr);
    fn context_id_of(&self, ctx: &str) -> Option<u32>;
    /// Re-place a context on a new node, bumping the mapping version.
    fn relocate(&self, ctx: &str, node: NodeAddr);
    fn snapshot(&self) -> shared_types::MappingSnapshot;
    fn update_to(&self, snapshot: &shared_types::MappingSnapshot);
}

/// The transport seam: one call per protocol step. Implementations resolve
/// nothing; the service routes, the sender delivers.
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send(
        &self,
        dest: NodeAddr,
        message: Envelope<ProtocolMessage>,
    ) -> Result<(), CoordinationError>;
}

/// Upcalls into the application runtime hosting the contexts.
#[async_trait]
pub trait RuntimeUpcall: Send + Sync {
    /// Run an event body inside `context`.
    async fn execute_event(
        &self,
        context: &str,
        event_id: OrderId,
        method: &str,
        payload: &[u8],
    ) -> Result<(), CoordinationError>;

    /// Serialize the application state of `context` for transfer.
    async fn snapshot_state(&self, context: &str) -> Result<Vec<u8>, CoordinationError>;

    /// Restore application state on the destination node.
    async fn restore_state(&self, context: &str, state: &[u8]) -> Result<(), CoordinationError>;
}

/// Mock implementations for testing.
#[cfg(test)]
pub mod mocks {
    use super::*;
    use std::sync::Mutex;

    /// Sender that records every message instead of delivering it.
    #[derive(Default)]
    pub struct RecordingSender {
        pub sent: Mutex<Vec<(NodeAddr, ProtocolMessage)>>,
    }

    #[async_trait]
    impl MessageSender for RecordingSender {
        async fn send(
            &self,
            dest: NodeAddr,
            message: Envelope<ProtocolMessage>,
        ) -> Result<(), CoordinationError> {
            self.sent.lock().unwrap().push((dest, message.payload));
            Ok(())
        }
    }

    /// Upcall that records executed events and returns empty snapshots.
    #[derive(Default)]
    pub struct RecordingUpcall {
        pub executed: Mutex<Vec<(String, OrderId, String)>>,
    }

    #[async_trait]
    impl RuntimeUpcall for RecordingUpcall {
        async fn execute_event(
            &self,
            context: &str,
            event_id: OrderId,
            method: &str,
            _payload: &[u8],
        ) -> Result<(), CoordinationError> {
            self.executed
                .lock()
                .unwrap()
                .push((context.to_string(), event_id, method.to_string()));
            Ok(())
        }

        async fn snapshot_state(&self, _context: &str) -> Result<Vec<u8>, CoordinationError> {
            Ok(Vec::new())
        }

        async fn restore_state(
            &self,
            _context: &str,
            _state: &[u8],
        ) -> Result<(), CoordinationError> {
            Ok(())
        }
    }
}
