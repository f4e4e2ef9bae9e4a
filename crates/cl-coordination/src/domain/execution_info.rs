//! Per-(context, event) scratch state.
//!
//! Lives from the moment a context first learns about an event until the
//! event commits there, at which point the whole record is dropped. Nothing
//! in here is shared across nodes; operation records are copied in and out
//! of messages.

use serde::{Deserialize, Serialize};
use shared_types::{
    AccessKind, ContextName, DeferredMessage, EventOpKind, EventOperationInfo, SubEventRequest,
};
use std::collections::BTreeSet;
use tracing::debug;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EventExecutionInfo {
    pub create_context: ContextName,
    pub target_context: ContextName,
    pub access: Option<AccessKind>,

    /// Contexts this event entered this context *from*.
    from_contexts: BTreeSet<ContextName>,
    /// Contexts this event went on to, still outstanding for commit fan-in.
    to_contexts: BTreeSet<ContextName>,
    /// Accumulated copy of every context the event executed in; survives the
    /// fan-in erasure of `to_contexts`.
    to_contexts_copy: BTreeSet<ContextName>,

    /// Child operations issued from this context, pending completion.
    event_ops: Vec<EventOperationInfo>,
    /// Sub-events spawned here, released to the create pipeline on commit.
    sub_events: Vec<SubEventRequest>,
    /// Outbound application messages deferred until commit.
    deferred_messages: Vec<DeferredMessage>,

    /// Dominator grants already obtained; spares a repeat round-trip.
    permit_contexts: BTreeSet<ContextName>,
    /// Grant requests this context holds on behalf of its descendants.
    local_lock_requests: Vec<EventOperationInfo>,
    /// Descendant contexts locked through those requests.
    locked_children: BTreeSet<ContextName>,

    /// Ownership-DAG edits accumulated during execution.
    ownership_ops: Vec<EventOperationInfo>,

    next_op_ticket: u64,
    new_context_id: Option<u32>,
    already_committed: bool,
}

impl EventExecutionInfo {
    pub fn new(
        create_context: impl Into<ContextName>,
        target_context: impl Into<ContextName>,
        access: AccessKind,
    ) -> Self {
        Self {
            create_context: create_context.into(),
            target_context: target_context.into(),
            access: Some(access),
            ..Self::default()
        }
    }

    // ---- permission cache ---------------------------------------------

    pub fn add_permit_context(&mut self, ctx: impl Into<ContextName>) {
        self.permit_contexts.insert(ctx.into());
    }

    pub fn permit_cached(&self, ctx: &str) -> bool {
        self.permit_contexts.contains(ctx)
    }

    pub fn permit_contexts(&self) -> &BTreeSet<ContextName> {
        &self.permit_contexts
    }

    pub fn clear_permit_cache(&mut self) {
        self.permit_contexts.clear();
    }

    // ---- from/to tracking ---------------------------------------------

    pub fn add_from_context(&mut self, ctx: impl Into<ContextName>) {
        self.from_contexts.insert(ctx.into());
    }

    pub fn add_to_context(&mut self, ctx: impl Into<ContextName>) {
        let ctx = ctx.into();
        if self.to_contexts.insert(ctx.clone()) {
            self.to_contexts_copy.insert(ctx.clone());
        }
        self.locked_children.insert(ctx);
    }

    pub fn add_to_context_copy(&mut self, ctx: impl Into<ContextName>) {
        self.to_contexts_copy.insert(ctx.into());
    }

    pub fn add_executed_contexts(&mut self, ctxs: impl IntoIterator<Item = ContextName>) {
        self.to_contexts_copy.extend(ctxs);
    }

    /// Fan-in: `ctx` reported ready to commit. Erasing a context that was
    /// never outstanding is a protocol violation.
    pub fn erase_to_context(&mut self, ctx: &str) {
        assert!(
            self.to_contexts.remove(ctx),
            "context {ctx} not outstanding for this event"
        );
        debug!(remaining = self.to_contexts.len(), "to-context erased");
    }

    pub fn outstanding_to_contexts(&self) -> usize {
        self.to_contexts.len()
    }

    pub fn to_contexts(&self) -> &BTreeSet<ContextName> {
        &self.to_contexts
    }

    pub fn to_contexts_copy(&self) -> &BTreeSet<ContextName> {
        &self.to_contexts_copy
    }

    pub fn from_contexts(&self) -> &BTreeSet<ContextName> {
        &self.from_contexts
    }

    // ---- child operations ---------------------------------------------

    pub fn next_op_ticket(&mut self) -> u64 {
        self.next_op_ticket += 1;
        self.next_op_ticket
    }

    pub fn add_event_op(&mut self, op: EventOperationInfo) {
        if !self.event_ops.contains(&op) {
            self.event_ops.push(op);
        }
    }

    pub fn remove_event_op(&mut self, op: &EventOperationInfo) {
        if let Some(pos) = self.event_ops.iter().position(|o| o == op) {
            self.event_ops.remove(pos);
        }
    }

    // ---- deferred work ------------------------------------------------

    pub fn enqueue_sub_event(&mut self, request: SubEventRequest) {
        self.sub_events.push(request);
    }

    pub fn take_sub_events(&mut self) -> Vec<SubEventRequest> {
        std::mem::take(&mut self.sub_events)
    }

    pub fn enqueue_deferred_message(&mut self, message: DeferredMessage) {
        self.deferred_messages.push(message);
    }

    pub fn take_deferred_messages(&mut self) -> Vec<DeferredMessage> {
        std::mem::take(&mut self.deferred_messages)
    }

    // ---- local lock requests ------------------------------------------

    /// Hold a descendant's grant request here. Duplicate requests indicate a
    /// protocol bug.
    pub fn enqueue_local_lock_request(&mut self, op: EventOperationInfo) {
        assert!(
            !self.local_lock_requests.contains(&op),
            "local lock request {op} already held"
        );
        self.locked_children.insert(op.to_context.clone());
        self.local_lock_requests.push(op);
    }

    pub fn local_lock_requests(&self) -> Vec<EventOperationInfo> {
        self.local_lock_requests.clone()
    }

    pub fn locked_children(&self) -> Vec<ContextName> {
        self.locked_children.iter().cloned().collect()
    }

    pub fn clear_local_lock_requests(&mut self) {
        self.local_lock_requests.clear();
    }

    pub fn clear_locked_children(&mut self) {
        self.locked_children.clear();
    }

    /// Remove a matching held request; on success, absorb the requests and
    /// locked contexts the unlocking descendant handed back up.
    pub fn local_unlock(
        &mut self,
        op: &EventOperationInfo,
        handed_requests: &[EventOperationInfo],
        handed_contexts: &[ContextName],
    ) -> bool {
        if self.local_lock_requests.is_empty() {
            return false;
        }
        let Some(pos) = self.local_lock_requests.iter().position(|o| o == op) else {
            return false;
        };
        self.local_lock_requests.remove(pos);
        self.local_lock_requests
            .extend(handed_requests.iter().cloned());
        self.locked_children.extend(handed_contexts.iter().cloned());
        true
    }

    // ---- ownership ops ------------------------------------------------

    /// Accumulate an ownership edit. An add and a remove of the same edge
    /// cancel each other; a repeat of the same edit is dropped.
    pub fn enqueue_ownership_op(&mut self, op: EventOperationInfo) {
        if let Some(pos) = self.ownership_ops.iter().position(|existing| {
            existing.from_context == op.from_context && existing.to_context == op.to_context
        }) {
            if self.ownership_ops[pos].kind == op.kind {
                return;
            }
            self.ownership_ops.remove(pos);
            return;
        }
        self.ownership_ops.push(op);
    }

    pub fn take_ownership_ops(&mut self) -> Vec<EventOperationInfo> {
        std::mem::take(&mut self.ownership_ops)
    }

    pub fn parent_child_related(&self, parent: &str, child: &str) -> bool {
        self.ownership_ops.iter().any(|op| {
            op.kind == Some(EventOpKind::AddOwnership)
                && op.from_context == parent
                && op.to_context == child
        })
    }

    /// Extract the add-edge op that created `child` under `parent`, if one
    /// was accumulated here.
    pub fn take_new_context_op(&mut self, parent: &str, child: &str) -> Option<EventOperationInfo> {
        let pos = self.ownership_ops.iter().position(|op| {
            op.kind == Some(EventOpKind::AddOwnership)
                && op.from_context == parent
                && op.to_context == child
        })?;
        Some(self.ownership_ops.remove(pos))
    }

    // ---- commit flags -------------------------------------------------

    pub fn set_new_context_id(&mut self, id: u32) {
        self.new_context_id = Some(id);
    }

    pub fn new_context_id(&self) -> Option<u32> {
        self.new_context_id
    }

    pub fn mark_ready_committed(&mut self) {
        self.already_committed = true;
    }

    pub fn is_ready_committed(&self) -> bool {
        self.already_committed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared_types::{EventOpKind, OrderId};

    fn op(ticket: u64, from: &str, to: &str, kind: EventOpKind) -> EventOperationInfo {
        EventOperationInfo::new(
            OrderId::new(1, 1),
            kind,
            AccessKind::Write,
            from,
            to,
            ticket,
        )
    }

    #[test]
    fn test_permit_cache() {
        let mut info = EventExecutionInfo::new("A", "B", AccessKind::Write);
        assert!(!info.permit_cached("B"));
        info.add_permit_context("B");
        assert!(info.permit_cached("B"));
        info.clear_permit_cache();
        assert!(!info.permit_cached("B"));
    }

    #[test]
    fn test_to_context_copy_survives_erasure() {
        let mut info = EventExecutionInfo::new("A", "B", AccessKind::Write);
        info.add_to_context("C");
        info.erase_to_context("C");
        assert_eq!(info.outstanding_to_contexts(), 0);
        assert!(info.to_contexts_copy().contains("C"));
    }

    #[test]
    #[should_panic]
    fn test_erasing_unknown_to_context_is_fatal() {
        let mut info = EventExecutionInfo::new("A", "B", AccessKind::Write);
        info.erase_to_context("C");
    }

    #[test]
    fn test_ownership_add_remove_cancel() {
        let mut info = EventExecutionInfo::new("A", "B", AccessKind::Ownership);
        info.enqueue_ownership_op(op(1, "A", "C", EventOpKind::AddOwnership));
        info.enqueue_ownership_op(op(2, "A", "C", EventOpKind::RemoveOwnership));
        assert!(info.take_ownership_ops().is_empty());
    }

    #[test]
    fn test_duplicate_ownership_op_dropped() {
        let mut info = EventExecutionInfo::new("A", "B", AccessKind::Ownership);
        info.enqueue_ownership_op(op(1, "A", "C", EventOpKind::AddOwnership));
        info.enqueue_ownership_op(op(2, "A", "C", EventOpKind::AddOwnership));
        assert_eq!(info.take_ownership_ops().len(), 1);
    }

    #[test]
    fn test_local_unlock_absorbs_handed_state() {
        let mut info = EventExecutionInfo::new("A", "B", AccessKind::Write);
        let held = op(1, "B", "C", EventOpKind::Async);
        info.enqueue_local_lock_request(held.clone());

        let handed = vec![op(2, "C", "D", EventOpKind::Async)];
        assert!(info.local_unlock(&held, &handed, &["D".to_string()]));
        assert_eq!(info.local_lock_requests().len(), 1);
        assert!(info.locked_children().contains(&"D".to_string()));
    }

    #[test]
    fn test_local_unlock_of_unknown_request_is_refused() {
        let mut info = EventExecutionInfo::new("A", "B", AccessKind::Write);
        assert!(!info.local_unlock(&op(1, "B", "C", EventOpKind::Async), &[], &[]));
    }

    #[test]
    fn test_op_tickets_increase() {
        let mut info = EventExecutionInfo::new("A", "B", AccessKind::Write);
        assert_eq!(info.next_op_ticket(), 1);
        assert_eq!(info.next_op_ticket(), 2);
    }
}
