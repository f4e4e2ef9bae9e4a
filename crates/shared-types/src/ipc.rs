//! Node-to-node protocol payloads.
//!
//! One variant per protocol step. The wire encoding of these payloads is the
//! transport's business; this module defines their logical fields only.

use crate::entities::{
    AccessKind, ContextName, DeferredMessage, EventOpKind, EventOperationInfo, NodeAddr, OrderId,
    SubEventRequest,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// An event as it travels between nodes: identity, routing, and the upcall
/// payload to run in the target context.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventRecord {
    pub event_id: OrderId,
    pub kind: EventOpKind,
    pub access: AccessKind,
    pub create_context: ContextName,
    pub target_context: ContextName,
    pub op: EventOperationInfo,
    pub method: String,
    pub payload: Vec<u8>,
}

/// Context-mapping snapshot circulated by migration control traffic.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MappingSnapshot {
    pub version: u64,
    pub head: NodeAddr,
    /// context name -> (numeric id, hosting node)
    pub entries: BTreeMap<ContextName, (u32, NodeAddr)>,
}

/// Steps of the migration control protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MigrationControlKind {
    /// Destination: contexts are on the way; start holding their messages.
    PrepareRecv,
    /// Destination acknowledges PrepareRecv to the coordinator.
    PrepareRecvAck,
    /// Carry the updated mapping to a node.
    UpdateMapping,
    /// Coordinator may release the mapping entry pinned for the move.
    ReleaseMapping,
    /// Migration finished; held messages may be released in arrival order.
    Done,
}

/// The full coordination protocol, one variant per message.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ProtocolMessage {
    /// Deliver an event to the node hosting its target context.
    EventDelivery {
        dest_context: ContextName,
        event: EventRecord,
    },

    /// Ask a dominator for permission to enter `op.to_context`.
    PermissionRequest {
        dest_context: ContextName,
        op: EventOperationInfo,
    },
    /// Grant from a dominator: `ops` may now touch `permitted_contexts`.
    PermissionReply {
        dest_context: ContextName,
        src_context: ContextName,
        event_id: OrderId,
        permitted_contexts: Vec<ContextName>,
        ops: Vec<EventOperationInfo>,
    },

    /// Walk an unlock up the access path toward the dominator.
    UnlockContext {
        dest_context: ContextName,
        op: EventOperationInfo,
        local_lock_requests: Vec<EventOperationInfo>,
        locked_contexts: Vec<ContextName>,
        src_context: ContextName,
    },
    /// Release a context an event held, at its dominator.
    ReleaseContext {
        dest_context: ContextName,
        event_id: OrderId,
        locked_context: ContextName,
        local_lock_requests: Vec<EventOperationInfo>,
        locked_contexts: Vec<ContextName>,
        src_context: ContextName,
    },
    /// Tell a context to drop the lock an event holds on it.
    ReleaseLockOnContext {
        dest_context: ContextName,
        src_context: ContextName,
        event_id: OrderId,
    },

    /// Hand a sub-event to the context that will create it at commit time.
    EnqueueSubEvent {
        dest_context: ContextName,
        op: EventOperationInfo,
        request: SubEventRequest,
    },
    EnqueueSubEventReply {
        dest_context: ContextName,
        op: EventOperationInfo,
    },

    /// Hand a deferred external message to the issuing event's home context.
    EnqueueDeferredMessage {
        dest_context: ContextName,
        op: EventOperationInfo,
        message: DeferredMessage,
    },
    EnqueueDeferredMessageReply {
        dest_context: ContextName,
        op: EventOperationInfo,
    },

    /// Accumulate ownership-DAG edits on the event's home context.
    EnqueueOwnershipOps {
        dest_context: ContextName,
        op: EventOperationInfo,
        src_context: ContextName,
        ops: Vec<EventOperationInfo>,
    },
    EnqueueOwnershipOpsReply {
        dest_context: ContextName,
        op: EventOperationInfo,
    },

    /// Route accumulated ownership edits to the governing dominator.
    OwnershipOperations {
        dest_context: ContextName,
        op: EventOperationInfo,
        src_context: ContextName,
        ops: Vec<EventOperationInfo>,
    },
    /// Final reply to the context that requested the ownership change.
    OwnershipOperationsReply {
        dest_context: ContextName,
        op: EventOperationInfo,
    },

    /// Ask nodes for fresh ownership pairs of the named contexts.
    DagRequest {
        dest: NodeAddr,
        requesting_context: ContextName,
        contexts: BTreeSet<ContextName>,
    },
    DagReply {
        dest_context: ContextName,
        contexts: BTreeSet<ContextName>,
        ownership_pairs: Vec<(ContextName, ContextName)>,
        versions: BTreeMap<ContextName, u64>,
    },

    /// Fan a structure change out to nodes hosting affected contexts.
    UpdateDominators {
        dest: NodeAddr,
        src_context: ContextName,
        dest_contexts: BTreeSet<ContextName>,
        forward_ops: Vec<EventOperationInfo>,
        ownership_pairs: Vec<(ContextName, ContextName)>,
        versions: BTreeMap<ContextName, u64>,
    },
    UpdateDominatorsReply {
        dest_context: ContextName,
        src_contexts: BTreeSet<ContextName>,
        ops: Vec<EventOperationInfo>,
    },

    /// Allocate an id for a context created inside a running event.
    CreateNewContext {
        op: EventOperationInfo,
        src_context: ContextName,
        context_type: String,
    },
    CreateNewContextReply {
        dest_context: ContextName,
        op: EventOperationInfo,
        new_context_id: u32,
    },

    /// An event finished everywhere; contexts may clear its state.
    CommitDone {
        dest_context: ContextName,
        src_context: ContextName,
        event_id: OrderId,
        executed_contexts: BTreeSet<ContextName>,
    },
    /// The target-side commit fan-in: `to_context` has no outstanding work.
    ReadyToCommitNotify {
        event_id: OrderId,
        to_context: ContextName,
        dest_contexts: Vec<ContextName>,
        executed_contexts: Vec<ContextName>,
    },

    /// An application message held back until its issuing event committed.
    DeferredDelivery { message: DeferredMessage },

    /// Migration control plane.
    MigrationControl {
        kind: MigrationControlKind,
        ticket: u64,
        contexts: BTreeMap<u32, ContextName>,
        mapping: MappingSnapshot,
        src: NodeAddr,
    },
    /// Destination tells the coordinator a context finished moving.
    CommitMigration {
        event_id: OrderId,
        context: ContextName,
        src: NodeAddr,
        dest: NodeAddr,
    },
    /// The serialized context itself: coordination params + application state.
    TransferContext {
        params: Vec<u8>,
        state: Vec<u8>,
        event_id: OrderId,
    },
}

impl ProtocolMessage {
    /// The context this message is addressed to, when it is context-routed
    /// (migration control and DAG fan-out are node-routed instead).
    pub fn dest_context(&self) -> Option<&ContextName> {
        use ProtocolMessage::*;
        match self {
            EventDelivery { dest_context, .. }
            | PermissionRequest { dest_context, .. }
            | PermissionReply { dest_context, .. }
            | UnlockContext { dest_context, .. }
            | ReleaseContext { dest_context, .. }
            | ReleaseLockOnContext { dest_context, .. }
            | EnqueueSubEvent { dest_context, .. }
            | EnqueueSubEventReply { dest_context, .. }
            | EnqueueDeferredMessage { dest_context, .. }
            | EnqueueDeferredMessageReply { dest_context, .. }
            | EnqueueOwnershipOps { dest_context, .. }
            | EnqueueOwnershipOpsReply { dest_context, .. }
            | OwnershipOperations { dest_context, .. }
            | OwnershipOperationsReply { dest_context, .. }
            | DagReply { dest_context, .. }
            | UpdateDominatorsReply { dest_context, .. }
            | CreateNewContextReply { dest_context, .. }
            | CommitDone { dest_context, .. } => Some(dest_context),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dest_context_for_context_routed_messages() {
        let msg = ProtocolMessage::ReleaseLockOnContext {
            dest_context: "A.B".into(),
            src_context: "A".into(),
            event_id: OrderId::new(1, 1),
        };
        assert_eq!(msg.dest_context().map(String::as_str), Some("A.B"));
    }

    #[test]
    fn test_node_routed_messages_have_no_dest_context() {
        let msg = ProtocolMessage::MigrationControl {
            kind: MigrationControlKind::Done,
            ticket: 4,
            contexts: BTreeMap::new(),
            mapping: MappingSnapshot::default(),
            src: NodeAddr::new("n1"),
        };
        assert!(msg.dest_context().is_none());
    }

    #[test]
    fn test_protocol_message_roundtrips_through_bincode() {
        let msg = ProtocolMessage::PermissionRequest {
            dest_context: "Root".into(),
            op: EventOperationInfo::new(
                OrderId::new(2, 5),
                EventOpKind::Async,
                AccessKind::Write,
                "Root",
                "Root.Child",
                1,
            ),
        };
        let bytes = bincode::serialize(&msg).unwrap();
        let back: ProtocolMessage = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back.dest_context().map(String::as_str), Some("Root"));
    }
}
