//! Queue entries used by the dominator protocol.
//!
//! A [`LockRequest`] is one per-context queue entry aggregating every
//! operation one event has pending against that context. A
//! [`DomLockRequest`] is the event's aggregate entry in the dominator's
//! global queue; it leaves that queue only when its operation list drains.

use crate::ports::outbound::StructureView;
use serde::{Deserialize, Serialize};
use shared_types::{AccessKind, ContextName, EventOperationInfo, OrderId};
use std::collections::BTreeSet;
use tracing::{debug, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockKind {
    Invalid,
    WLock,
    RLock,
    /// Virtual write lock: orders, never grants.
    VWLock,
    /// Virtual read lock: orders, never grants.
    VRLock,
    /// Former lock whose holder has unlocked; awaiting queue cleanup.
    Unlock,
    /// Ownership-modification lock, serialized globally at the dominator.
    DLock,
}

impl LockKind {
    pub fn from_access(access: AccessKind) -> Self {
        match access {
            AccessKind::Read => LockKind::RLock,
            AccessKind::Write => LockKind::WLock,
            AccessKind::Ownership => LockKind::DLock,
        }
    }

    pub fn virtual_of(access: AccessKind) -> Self {
        match access {
            AccessKind::Read => LockKind::VRLock,
            AccessKind::Write => LockKind::VWLock,
            AccessKind::Ownership => panic!("ownership operations take no virtual locks"),
        }
    }

    pub fn is_virtual(self) -> bool {
        matches!(self, LockKind::VRLock | LockKind::VWLock)
    }

    pub fn is_write_like(self) -> bool {
        matches!(self, LockKind::WLock | LockKind::VWLock)
    }
}

/// One queue entry per (context, event) at a dominator.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LockRequest {
    pub kind: LockKind,
    pub context: ContextName,
    pub event_id: OrderId,
    pub notified: bool,
    ops: Vec<EventOperationInfo>,
}

impl LockRequest {
    pub fn new(kind: LockKind, context: impl Into<ContextName>, event_id: OrderId) -> Self {
        Self {
            kind,
            context: context.into(),
            event_id,
            notified: false,
            ops: Vec::new(),
        }
    }

    /// Aggregate another operation of the same event; duplicates are dropped.
    pub fn push_op(&mut self, op: EventOperationInfo) {
        if !self.ops.contains(&op) {
            self.ops.push(op);
        }
    }

    pub fn op_count(&self) -> usize {
        self.ops.len()
    }

    pub fn ops(&self) -> Vec<EventOperationInfo> {
        self.ops.clone()
    }

    /// Drop the matching operation. Returns false when it was never here.
    pub fn unlock(&mut self, op: &EventOperationInfo) -> bool {
        if let Some(pos) = self.ops.iter().position(|o| o == op) {
            self.ops.remove(pos);
            true
        } else {
            false
        }
    }
}

/// One aggregate queue entry per event at a dominator.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DomLockRequest {
    pub kind: LockKind,
    pub event_id: OrderId,
    pub ops: Vec<EventOperationInfo>,
    pub locked_contexts: BTreeSet<ContextName>,
    pub notified: bool,
}

impl DomLockRequest {
    pub fn new(kind: LockKind, event_id: OrderId) -> Self {
        Self {
            kind,
            event_id,
            ops: Vec::new(),
            locked_contexts: BTreeSet::new(),
            notified: false,
        }
    }

    pub fn add_op(&mut self, op: EventOperationInfo) {
        if self.ops.contains(&op) {
            warn!(%op, "operation already aggregated at dominator");
            return;
        }
        self.locked_contexts.insert(op.to_context.clone());
        self.ops.push(op);
    }

    pub fn add_locked_context(&mut self, ctx: impl Into<ContextName>) {
        let ctx = ctx.into();
        if self.locked_contexts.insert(ctx.clone()) {
            debug!(event = %self.event_id, context = %ctx, "locked context recorded");
        }
    }

    pub fn add_locked_contexts(&mut self, ctxs: impl IntoIterator<Item = ContextName>) {
        for ctx in ctxs {
            self.add_locked_context(ctx);
        }
    }

    /// An entry whose operation list drained leaves the dominator queue.
    pub fn should_remove(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn locking_context(&self, ctx: &str) -> bool {
        self.ops.iter().any(|op| op.to_context == ctx)
    }

    /// Drop every operation of this event against `locked_context` whose
    /// origin is governed by `src_dominator`. A release for a context the
    /// event never locked is a protocol violation.
    ///
    /// For a DLOCK entry whose last operation just drained, every recorded
    /// locked context is handed back for release.
    pub fn release_context(
        &mut self,
        src_dominator: &str,
        locked_context: &str,
        view: &dyn StructureView,
    ) -> Vec<ContextName> {
        let before = self.ops.len();
        self.ops.retain(|op| {
            !(op.to_context == locked_context
                && view.dominator_of(&op.from_context).as_deref() == Some(src_dominator))
        });
        assert!(
            self.ops.len() < before,
            "event {} never locked {locked_context}",
            self.event_id
        );

        if self.kind != LockKind::DLock {
            return Vec::new();
        }
        if self.ops.is_empty() {
            let released: Vec<ContextName> = self.locked_contexts.iter().cloned().collect();
            self.locked_contexts.clear();
            released
        } else {
            Vec::new()
        }
    }

    /// Drop the exact operation. Returns false when it was never aggregated.
    /// A DLOCK entry that drains hands back all locked contexts via
    /// `releases`.
    pub fn unlock(&mut self, op: &EventOperationInfo, releases: &mut Vec<ContextName>) -> bool {
        let Some(pos) = self.ops.iter().position(|o| o == op) else {
            return false;
        };
        self.ops.remove(pos);

        if self.kind != LockKind::DLock {
            return true;
        }
        if self.ops.is_empty() {
            releases.extend(self.locked_contexts.iter().cloned());
            self.locked_contexts.clear();
        }
        true
    }

    /// Forget locked contexts that left this dominator's region after a
    /// structure change.
    pub fn retain_dominated(&mut self, dominated: &BTreeSet<ContextName>) {
        self.locked_contexts.retain(|c| dominated.contains(c));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared_types::EventOpKind;

    fn op(ticket: u64, from: &str, to: &str) -> EventOperationInfo {
        EventOperationInfo::new(
            OrderId::new(1, 1),
            EventOpKind::Async,
            AccessKind::Write,
            from,
            to,
            ticket,
        )
    }

    #[test]
    fn test_lock_request_aggregates_without_duplicates() {
        let mut req = LockRequest::new(LockKind::WLock, "B", OrderId::new(1, 1));
        req.push_op(op(1, "A", "B"));
        req.push_op(op(1, "A", "B"));
        req.push_op(op(2, "A", "B"));
        assert_eq!(req.op_count(), 2);
    }

    #[test]
    fn test_lock_request_unlock() {
        let mut req = LockRequest::new(LockKind::WLock, "B", OrderId::new(1, 1));
        req.push_op(op(1, "A", "B"));
        assert!(req.unlock(&op(1, "A", "B")));
        assert!(!req.unlock(&op(1, "A", "B")));
        assert_eq!(req.op_count(), 0);
    }

    #[test]
    fn test_dom_request_tracks_locked_contexts() {
        let mut req = DomLockRequest::new(LockKind::WLock, OrderId::new(1, 1));
        req.add_op(op(1, "A", "B"));
        req.add_op(op(2, "A", "C"));
        assert!(req.locked_contexts.contains("B"));
        assert!(req.locked_contexts.contains("C"));
        assert!(req.locking_context("B"));
        assert!(!req.locking_context("D"));
    }

    #[test]
    fn test_dom_unlock_drains_dlock_contexts() {
        let mut req = DomLockRequest::new(LockKind::DLock, OrderId::new(1, 1));
        req.add_op(op(1, "A", "B"));
        req.add_locked_context("C");

        let mut releases = Vec::new();
        assert!(req.unlock(&op(1, "A", "B"), &mut releases));
        assert!(req.should_remove());
        assert!(releases.contains(&"B".to_string()));
        assert!(releases.contains(&"C".to_string()));
    }

    #[test]
    fn test_dom_unlock_of_rlock_keeps_locked_contexts() {
        let mut req = DomLockRequest::new(LockKind::RLock, OrderId::new(1, 1));
        req.add_op(op(1, "A", "B"));

        let mut releases = Vec::new();
        assert!(req.unlock(&op(1, "A", "B"), &mut releases));
        assert!(releases.is_empty());
    }

    #[test]
    fn test_retain_dominated_prunes_departed_contexts() {
        let mut req = DomLockRequest::new(LockKind::WLock, OrderId::new(1, 1));
        req.add_locked_context("B");
        req.add_locked_context("C");

        let dominated: BTreeSet<ContextName> = ["B".to_string()].into_iter().collect();
        req.retain_dominated(&dominated);
        assert!(req.locked_contexts.contains("B"));
        assert!(!req.locked_contexts.contains("C"));
    }
}
