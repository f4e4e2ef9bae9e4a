//! Core identifiers and the cross-context operation record.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Canonical, hierarchical context name (e.g. `"Router.Worker[3]"`).
pub type ContextName = String;

/// Address of a physical node hosting contexts.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeAddr(pub String);

impl NodeAddr {
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into())
    }
}

impl fmt::Display for NodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Globally unique identity of an event, scoped to the context that created
/// it. Immutable once issued. A zero ticket denotes the null id.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderId {
    /// Numeric id of the creating context.
    pub context_id: u32,
    /// Create ticket handed out by that context, strictly increasing from 1.
    pub ticket: u64,
}

impl OrderId {
    pub fn new(context_id: u32, ticket: u64) -> Self {
        Self { context_id, ticket }
    }

    pub fn is_null(&self) -> bool {
        self.ticket == 0
    }
}

impl Ord for OrderId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.ticket, self.context_id).cmp(&(other.ticket, other.context_id))
    }
}

impl PartialOrd for OrderId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.context_id, self.ticket)
    }
}

/// What an operation does once admitted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventOpKind {
    /// A new top-level or sub event executing in its target context.
    Async,
    /// A synchronous call into another context; the caller blocks for it.
    Routine,
    /// A broadcast delivery into a context the event may already hold.
    Broadcast,
    /// Add an ownership edge to the DAG.
    AddOwnership,
    /// Remove an ownership edge from the DAG.
    RemoveOwnership,
}

/// The lock class a cross-context access requires at the dominator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AccessKind {
    Read,
    Write,
    /// Structural modification of the ownership DAG.
    Ownership,
}

/// One required cross-context access, copied across message boundaries.
///
/// Identity for queue matching is `(event_id, ticket, to_context)`: the same
/// event issues many operations, distinguished by its per-event `ticket`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EventOperationInfo {
    pub event_id: OrderId,
    pub kind: Option<EventOpKind>,
    pub access: Option<AccessKind>,
    /// Context the access is made from.
    pub from_context: ContextName,
    /// Context the access targets.
    pub to_context: ContextName,
    /// Context whose dominator must approve this operation.
    pub require_context: ContextName,
    /// Per-event monotonic operation ticket, ordering sibling operations.
    pub ticket: u64,
    /// Upcall entry point to run in the target context.
    pub method: String,
    /// Ancestor contexts this event has already entered, in entry order.
    pub accessed_contexts: Vec<ContextName>,
    /// Grants piggybacked on permission replies.
    pub permit_contexts: Vec<ContextName>,
    /// Contexts created by this operation.
    pub new_contexts: BTreeSet<ContextName>,
    /// Ownership-DAG version this event has observed, per context.
    pub dag_versions: BTreeMap<ContextName, u64>,
}

impl PartialEq for EventOperationInfo {
    fn eq(&self, other: &Self) -> bool {
        self.event_id == other.event_id
            && self.ticket == other.ticket
            && self.to_context == other.to_context
    }
}

impl Eq for EventOperationInfo {}

impl EventOperationInfo {
    pub fn new(
        event_id: OrderId,
        kind: EventOpKind,
        access: AccessKind,
        from_context: impl Into<ContextName>,
        to_context: impl Into<ContextName>,
        ticket: u64,
    ) -> Self {
        let to_context = to_context.into();
        Self {
            event_id,
            kind: Some(kind),
            access: Some(access),
            from_context: from_context.into(),
            require_context: to_context.clone(),
            to_context,
            ticket,
            ..Self::default()
        }
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    pub fn with_require_context(mut self, ctx: impl Into<ContextName>) -> Self {
        self.require_context = ctx.into();
        self
    }

    /// The context entered immediately before `ctx` on this event's access
    /// path. Empty when `ctx` is the first entry.
    pub fn prior_accessed_context(&self, ctx: &str) -> ContextName {
        assert!(
            !self.accessed_contexts.is_empty(),
            "event {} has an empty access path",
            self.event_id
        );
        let pos = self
            .accessed_contexts
            .iter()
            .rposition(|c| c == ctx)
            .unwrap_or_else(|| panic!("context {ctx} not on access path of {}", self.event_id));
        if pos == 0 {
            ContextName::new()
        } else {
            self.accessed_contexts[pos - 1].clone()
        }
    }

    pub fn has_accessed(&self, ctx: &str) -> bool {
        self.accessed_contexts.iter().any(|c| c == ctx)
    }

    /// Record entry into `ctx`. Entering the same context twice on one
    /// operation path is a protocol violation.
    pub fn add_accessed_context(&mut self, ctx: impl Into<ContextName>) {
        let ctx = ctx.into();
        assert!(
            !self.has_accessed(&ctx),
            "context {ctx} already on access path of {}",
            self.event_id
        );
        self.accessed_contexts.push(ctx);
    }

    pub fn set_dag_version(&mut self, ctx: impl Into<ContextName>, version: u64) {
        self.dag_versions.insert(ctx.into(), version);
    }
}

impl fmt::Display for EventOperationInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "op(event={}, ticket={}, {} -> {}, require={})",
            self.event_id, self.ticket, self.from_context, self.to_context, self.require_context
        )
    }
}

/// A sub-event spawned during execution, deferred until its parent commits.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubEventRequest {
    pub target_context: ContextName,
    pub method: String,
    pub payload: Vec<u8>,
}

/// An outbound application message deferred until the issuing event commits.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeferredMessage {
    pub dest: NodeAddr,
    pub channel: u8,
    pub payload: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_id_ordering_by_ticket_first() {
        let a = OrderId::new(7, 1);
        let b = OrderId::new(2, 2);
        assert!(a < b);
        assert!(OrderId::new(1, 5) < OrderId::new(2, 5));
    }

    #[test]
    fn test_null_order_id() {
        assert!(OrderId::default().is_null());
        assert!(!OrderId::new(1, 1).is_null());
    }

    #[test]
    fn test_op_identity_ignores_routing_fields() {
        let mut a = EventOperationInfo::new(
            OrderId::new(1, 1),
            EventOpKind::Async,
            AccessKind::Write,
            "A",
            "B",
            1,
        );
        let mut b = a.clone();
        a.permit_contexts.push("C".into());
        b.require_context = "D".into();
        assert_eq!(a, b);

        let c = EventOperationInfo::new(
            OrderId::new(1, 1),
            EventOpKind::Async,
            AccessKind::Write,
            "A",
            "B",
            2,
        );
        assert_ne!(a, c);
    }

    #[test]
    fn test_prior_accessed_context_walks_backwards() {
        let mut op = EventOperationInfo::new(
            OrderId::new(1, 3),
            EventOpKind::Routine,
            AccessKind::Write,
            "A",
            "C",
            1,
        );
        op.add_accessed_context("A");
        op.add_accessed_context("B");
        op.add_accessed_context("C");
        assert_eq!(op.prior_accessed_context("C"), "B");
        assert_eq!(op.prior_accessed_context("A"), "");
    }

    #[test]
    #[should_panic]
    fn test_double_entry_is_fatal() {
        let mut op = EventOperationInfo::new(
            OrderId::new(1, 3),
            EventOpKind::Async,
            AccessKind::Read,
            "A",
            "B",
            1,
        );
        op.add_accessed_context("A");
        op.add_accessed_context("A");
    }
}
