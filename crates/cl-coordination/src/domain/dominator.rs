//! The hierarchical permission manager.
//!
//! One dominator serializes cross-context access for the cluster of contexts
//! it governs. Ordinary read/write operations queue per target context;
//! ownership-modifying operations (DLOCK) queue globally and block everything
//! behind them until they finish. Virtual locks (VRLOCK/VWLOCK) are placed in
//! the queues of governed ancestors of a target purely to preserve relative
//! ordering; they confer no access and never appear in a grant.

use crate::domain::lock_request::{DomLockRequest, LockKind, LockRequest};
use crate::ports::outbound::StructureView;
use serde::{Deserialize, Serialize};
use shared_types::{AccessKind, ContextName, EventOperationInfo, OrderId};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Grants and releases produced by a queue pass, for the service to fan out.
#[derive(Debug, Default)]
pub struct DominatorOutcome {
    /// Operations now permitted, keyed by the context that required approval.
    pub permitted_ops: BTreeMap<ContextName, Vec<EventOperationInfo>>,
    /// Context names each event may now enter.
    pub permitted_contexts: BTreeMap<OrderId, Vec<ContextName>>,
    /// Contexts whose locks must be dropped.
    pub release_contexts: Vec<ContextName>,
}

impl DominatorOutcome {
    pub fn is_empty(&self) -> bool {
        self.permitted_ops.is_empty()
            && self.permitted_contexts.is_empty()
            && self.release_contexts.is_empty()
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Dominator {
    context_name: ContextName,

    pre_dominator: ContextName,
    cur_dominator: ContextName,
    version: u64,

    dominate_contexts: Vec<ContextName>,
    event_order_queue: BTreeMap<ContextName, Vec<LockRequest>>,
    dom_lock_request_queue: Vec<DomLockRequest>,
    waiting_unlock_requests: Vec<EventOperationInfo>,

    update_waiting_contexts: BTreeSet<ContextName>,
    update_source_contexts: BTreeSet<ContextName>,
    update_reply_ops: Vec<EventOperationInfo>,
}

impl Dominator {
    pub fn initialize(
        &mut self,
        context_name: impl Into<ContextName>,
        dominator: impl Into<ContextName>,
        version: u64,
        dominated: Vec<ContextName>,
    ) {
        self.context_name = context_name.into();
        self.pre_dominator = ContextName::new();
        self.cur_dominator = dominator.into();
        self.version = version;
        self.event_order_queue = dominated
            .iter()
            .map(|c| (c.clone(), Vec::new()))
            .collect();
        self.dominate_contexts = dominated;
        debug!(
            context = %self.context_name,
            dominated = ?self.dominate_contexts,
            "dominator initialized"
        );
    }

    pub fn context_name(&self) -> &str {
        &self.context_name
    }

    /// Structure version this dominator state was derived from.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn pre_dominator(&self) -> &str {
        &self.pre_dominator
    }

    pub fn cur_dominator(&self) -> &str {
        &self.cur_dominator
    }

    pub fn dominated(&self) -> &[ContextName] {
        &self.dominate_contexts
    }

    pub fn includes_context(&self, ctx: &str) -> bool {
        self.event_order_queue.contains_key(ctx)
    }

    // ---- request intake -----------------------------------------------

    /// Enqueue `op` and compute what its event may already touch. The
    /// returned set is the immediate grant (possibly empty).
    pub fn check_execute_permission(
        &mut self,
        view: &dyn StructureView,
        op: &EventOperationInfo,
    ) -> BTreeSet<ContextName> {
        assert!(
            self.includes_context(&op.to_context),
            "dominator {} does not govern {}",
            self.context_name,
            op.to_context
        );

        if let Some(request) = self
            .dom_lock_request_queue
            .iter_mut()
            .find(|r| r.event_id == op.event_id)
        {
            request.add_op(op.clone());
        } else {
            let access = op.access.expect("operation without access class");
            let mut request = DomLockRequest::new(LockKind::from_access(access), op.event_id);
            request.add_op(op.clone());
            self.dom_lock_request_queue.push(request);
            debug!(
                dominator = %self.context_name,
                event = %op.event_id,
                "request enqueued at dominator"
            );
        }

        self.enqueue_event_order_queue(view, op);
        self.event_permit_contexts(op.event_id)
    }

    /// Put a read/write operation into its target's queue, with virtual
    /// locks fanned out to governed ancestors of the target. Ownership
    /// operations never enter per-context queues.
    fn enqueue_event_order_queue(&mut self, view: &dyn StructureView, op: &EventOperationInfo) {
        assert!(self.includes_context(&op.to_context));

        let access = op.access.expect("operation without access class");
        if access == AccessKind::Ownership {
            debug!(
                dominator = %self.context_name,
                event = %op.event_id,
                "structural operation held at dominator queue"
            );
            return;
        }

        // Only events ahead of every pending DLOCK may enter the queues.
        let mut may_lock = false;
        for request in &self.dom_lock_request_queue {
            if request.kind == LockKind::DLock {
                break;
            }
            if request.event_id == op.event_id {
                may_lock = true;
                break;
            }
        }
        if !may_lock {
            return;
        }

        let kind = LockKind::from_access(access);
        let vkind = LockKind::virtual_of(access);

        let queue = self
            .event_order_queue
            .get_mut(&op.to_context)
            .expect("governed context has a queue");
        let mut existed = false;
        for entry in queue.iter_mut() {
            if entry.event_id == op.event_id {
                entry.kind = kind;
                entry.push_op(op.clone());
                existed = true;
            }
        }
        if !existed {
            let mut entry = LockRequest::new(kind, op.to_context.clone(), op.event_id);
            entry.push_op(op.clone());
            queue.push(entry);

            // Ordering placeholders for governed ancestors of the target.
            for ctx in self.dominate_contexts.clone() {
                if ctx == op.to_context || !view.is_elder_context(&ctx, &op.to_context) {
                    continue;
                }
                let queue = self.event_order_queue.get_mut(&ctx).expect("queue exists");
                if queue.iter().all(|e| e.event_id != op.event_id) {
                    debug!(
                        dominator = %self.context_name,
                        event = %op.event_id,
                        context = %ctx,
                        "virtual lock placed"
                    );
                    queue.push(LockRequest::new(vkind, ctx.clone(), op.event_id));
                }
            }
        }
    }

    /// The contexts `event` may enter right now, marking the granted entries
    /// notified.
    fn event_permit_contexts(&mut self, event: OrderId) -> BTreeSet<ContextName> {
        let mut permits = BTreeSet::new();

        let kind = self
            .dom_lock_request_queue
            .iter()
            .find(|r| r.event_id == event)
            .map(|r| r.kind)
            .expect("event has a dominator queue entry");

        if self.can_lock_event_ids().contains(&event) {
            self.label_notified(event);
            if kind == LockKind::DLock {
                permits.extend(self.dominate_contexts.iter().cloned());
            }
        }
        if kind == LockKind::DLock {
            return permits;
        }

        for (ctx, queue) in self.event_order_queue.iter_mut() {
            for (i, entry) in queue.iter_mut().enumerate() {
                if entry.event_id == event {
                    entry.notified = true;
                    // Virtual entries order, never grant.
                    if !entry.kind.is_virtual()
                        && ((kind == LockKind::WLock && i == 0) || kind == LockKind::RLock)
                    {
                        permits.insert(ctx.clone());
                    }
                    break;
                }
                if kind == LockKind::WLock
                    || entry.kind.is_write_like()
                    || entry.kind == LockKind::Unlock
                {
                    break;
                }
            }
        }
        permits
    }

    /// Events currently ahead of (or at the head of) any pending DLOCK.
    fn can_lock_event_ids(&self) -> BTreeSet<OrderId> {
        let mut ids = BTreeSet::new();
        for (i, request) in self.dom_lock_request_queue.iter().enumerate() {
            if request.kind == LockKind::DLock {
                if i == 0 {
                    ids.insert(request.event_id);
                }
                break;
            }
            ids.insert(request.event_id);
        }
        ids
    }

    fn label_notified(&mut self, event: OrderId) {
        if let Some(request) = self
            .dom_lock_request_queue
            .iter_mut()
            .find(|r| r.event_id == event)
        {
            request.notified = true;
        }
    }

    // ---- unlock / release ---------------------------------------------

    /// Drop one operation of `op.event_id`. Returns false when the operation
    /// is not (yet) known here; the caller parks it for retry.
    pub fn unlock_context(
        &mut self,
        view: &dyn StructureView,
        op: &EventOperationInfo,
        out: &mut DominatorOutcome,
    ) -> bool {
        assert_eq!(
            view.dominator_of(&op.from_context).as_deref(),
            Some(self.context_name.as_str()),
            "unlock routed to the wrong dominator"
        );
        assert!(self.includes_context(&op.to_context));

        let mut locked_contexts = BTreeSet::new();
        let mut found = false;
        for request in self.dom_lock_request_queue.iter_mut() {
            if request.event_id == op.event_id {
                if !request.unlock(op, &mut out.release_contexts) {
                    return false;
                }
                locked_contexts = request.locked_contexts.clone();
                found = true;
                break;
            }
        }
        if !found {
            return false;
        }

        let kind = LockKind::from_access(op.access.expect("operation without access class"));
        if matches!(kind, LockKind::RLock | LockKind::WLock) {
            let queue = self
                .event_order_queue
                .get_mut(&op.to_context)
                .expect("queue exists");
            let mut matched = false;
            for entry in queue.iter_mut() {
                if entry.event_id == op.event_id && entry.kind == kind && entry.unlock(op) {
                    if entry.op_count() == 0 {
                        entry.kind = LockKind::Unlock;
                    }
                    matched = true;
                    break;
                }
            }
            assert!(
                matched,
                "event {} does not lock {} at dominator {}",
                op.event_id, op.to_context, self.context_name
            );
        }

        self.check_event_order_queue(view, op.event_id, kind, &locked_contexts, out);
        true
    }

    /// Retry unlocks that arrived before their requests were known here.
    pub fn unlock_waiting_requests(
        &mut self,
        view: &dyn StructureView,
        event: OrderId,
        out: &mut DominatorOutcome,
    ) {
        let waiting = std::mem::take(&mut self.waiting_unlock_requests);
        for op in waiting {
            if op.event_id == event && self.unlock_context(view, &op, out) {
                debug!(dominator = %self.context_name, %op, "deferred unlock executed");
            } else {
                self.waiting_unlock_requests.push(op);
            }
        }
    }

    pub fn add_waiting_unlock(&mut self, op: EventOperationInfo) {
        debug!(dominator = %self.context_name, %op, "unlock parked until request arrives");
        self.waiting_unlock_requests.push(op);
    }

    /// Release an entire context an event held (the event left it for good).
    pub fn release_context(
        &mut self,
        view: &dyn StructureView,
        event: OrderId,
        locked_context: &str,
        src_dominator: &str,
        out: &mut DominatorOutcome,
    ) -> bool {
        assert!(self.includes_context(locked_context));

        let mut locked_contexts = BTreeSet::new();
        let mut kind = LockKind::Invalid;
        let mut found = false;
        for request in self.dom_lock_request_queue.iter_mut() {
            if request.event_id == event {
                let released = request.release_context(src_dominator, locked_context, view);
                out.release_contexts.extend(released);
                kind = request.kind;
                locked_contexts = request.locked_contexts.clone();
                found = true;
                break;
            }
        }
        assert!(
            found,
            "event {event} missing from dominator {} queue",
            self.context_name
        );

        if matches!(kind, LockKind::RLock | LockKind::WLock) {
            let queue = self
                .event_order_queue
                .get_mut(locked_context)
                .expect("queue exists");
            let entry = queue
                .iter_mut()
                .find(|e| e.event_id == event)
                .unwrap_or_else(|| {
                    panic!(
                        "event {event} does not lock {locked_context} at dominator {}",
                        self.context_name
                    )
                });
            entry.kind = LockKind::Unlock;
        }

        self.check_event_order_queue(view, event, kind, &locked_contexts, out);
        true
    }

    /// The queue pass run after any unlock/release: garbage-collect drained
    /// requests, admit the next dominator-queue entries, clean up virtual
    /// and unlocked entries of `event`, and compute the next per-context
    /// grants.
    fn check_event_order_queue(
        &mut self,
        view: &dyn StructureView,
        event: OrderId,
        kind: LockKind,
        locked_contexts: &BTreeSet<ContextName>,
        out: &mut DominatorOutcome,
    ) {
        self.dom_lock_request_queue.retain(|r| {
            if r.should_remove() {
                debug!(
                    dominator = %self.context_name,
                    event = %r.event_id,
                    "drained request leaves dominator queue"
                );
                false
            } else {
                true
            }
        });

        // Admit newly-unblocked dominator-queue entries.
        let mut to_lock_ops = Vec::new();
        for (i, request) in self.dom_lock_request_queue.iter_mut().enumerate() {
            if !request.notified {
                if request.kind == LockKind::DLock && i != 0 {
                    break;
                }
                request.notified = true;
                assert!(!request.ops.is_empty());
                for op in &request.ops {
                    assert!(!op.require_context.is_empty());
                    if request.kind == LockKind::DLock {
                        out.permitted_ops
                            .entry(op.require_context.clone())
                            .or_default()
                            .push(op.clone());
                    } else {
                        to_lock_ops.push(op.clone());
                    }
                }
                if request.kind == LockKind::DLock {
                    out.permitted_contexts
                        .insert(request.event_id, self.dominate_contexts.clone());
                }
            }
            if request.kind == LockKind::DLock {
                break;
            }
        }
        for op in to_lock_ops {
            self.enqueue_event_order_queue(view, &op);
        }

        // Remove this event's virtual and unlocked entries from all queues.
        if matches!(kind, LockKind::RLock | LockKind::WLock) {
            let still_locked: BTreeSet<ContextName> = self
                .event_order_queue
                .iter()
                .filter(|(_, queue)| {
                    queue.iter().any(|e| {
                        e.event_id == event
                            && !e.kind.is_virtual()
                            && e.kind != LockKind::Unlock
                    })
                })
                .map(|(ctx, _)| ctx.clone())
                .collect();
            for ctx in self.dominate_contexts.clone() {
                if still_locked.contains(&ctx) {
                    continue;
                }
                if still_locked
                    .iter()
                    .any(|held| view.is_elder_context(&ctx, held))
                {
                    // A context below this one is still really held; its
                    // ordering placeholder must survive.
                    continue;
                }
                let queue = self.event_order_queue.get_mut(&ctx).expect("queue exists");
                let mut remove_at = None;
                for (i, entry) in queue.iter().enumerate() {
                    if entry.event_id != event {
                        continue;
                    }
                    match entry.kind {
                        LockKind::Unlock => {
                            out.release_contexts.push(ctx.clone());
                            remove_at = Some(i);
                        }
                        LockKind::VRLock | LockKind::VWLock => {
                            if locked_contexts.contains(&ctx) {
                                out.release_contexts.push(ctx.clone());
                            }
                            remove_at = Some(i);
                        }
                        _ => {}
                    }
                    break;
                }
                if let Some(i) = remove_at {
                    queue.remove(i);
                    debug!(
                        dominator = %self.context_name,
                        %event,
                        context = %ctx,
                        "queue entry cleared"
                    );
                }
            }
        }

        // Compute next grants: front writer, or contiguous front readers.
        for ctx in self.dominate_contexts.clone() {
            let queue = self.event_order_queue.get_mut(&ctx).expect("queue exists");
            for (i, entry) in queue.iter_mut().enumerate() {
                if entry.kind.is_write_like() && i != 0 {
                    break;
                }
                if !entry.notified && entry.kind != LockKind::Unlock {
                    entry.notified = true;
                    // Virtual entries order, never grant.
                    if !entry.kind.is_virtual() {
                        for op in entry.ops() {
                            out.permitted_ops
                                .entry(op.require_context.clone())
                                .or_default()
                                .push(op);
                        }
                        out.permitted_contexts
                            .entry(entry.event_id)
                            .or_default()
                            .push(ctx.clone());
                    }
                }
                if entry.kind.is_write_like() || entry.kind == LockKind::Unlock {
                    break;
                }
            }
        }
    }

    // ---- locked-context bookkeeping -----------------------------------

    pub fn has_request(&self, event: OrderId) -> bool {
        self.dom_lock_request_queue
            .iter()
            .any(|r| r.event_id == event)
    }

    pub fn add_locked_context(&mut self, event: OrderId, ctx: impl Into<ContextName>) {
        let request = self
            .dom_lock_request_queue
            .iter_mut()
            .find(|r| r.event_id == event)
            .unwrap_or_else(|| panic!("event {event} missing from dominator queue"));
        request.add_locked_context(ctx);
    }

    pub fn add_locked_contexts(&mut self, event: OrderId, ctxs: Vec<ContextName>) {
        let request = self
            .dom_lock_request_queue
            .iter_mut()
            .find(|r| r.event_id == event)
            .unwrap_or_else(|| panic!("event {event} missing from dominator queue"));
        request.add_locked_contexts(ctxs);
    }

    pub fn locked_context_count(&self, event: OrderId) -> usize {
        self.event_order_queue
            .values()
            .flat_map(|q| q.iter())
            .filter(|e| e.event_id == event)
            .count()
    }

    // ---- dominator reassignment ---------------------------------------

    /// Re-derive this node's dominator role after a structure change.
    /// In-flight operations whose governing dominator moved elsewhere are
    /// returned for forwarding; the per-context queues are rebuilt to match
    /// the new dominated set.
    pub fn update_dominator(&mut self, view: &dyn StructureView) -> Vec<EventOperationInfo> {
        self.pre_dominator = std::mem::take(&mut self.cur_dominator);
        self.cur_dominator = view
            .dominator_of(&self.context_name)
            .unwrap_or_default();
        self.dominate_contexts = view.dominated_set_of(&self.context_name);
        self.version = view.current_version();

        let dominated: BTreeSet<ContextName> = self.dominate_contexts.iter().cloned().collect();
        debug!(
            context = %self.context_name,
            pre = %self.pre_dominator,
            cur = %self.cur_dominator,
            dominated = ?self.dominate_contexts,
            "dominator updated"
        );

        let mut forward_ops = Vec::new();
        for request in self.dom_lock_request_queue.iter_mut() {
            let mut kept = Vec::new();
            for op in request.ops.drain(..) {
                if view.dominator_of(&op.require_context).as_deref()
                    == Some(self.context_name.as_str())
                {
                    kept.push(op);
                } else {
                    debug!(%op, "operation forwarded to its new dominator");
                    forward_ops.push(op);
                }
            }
            request.ops = kept;
            if !request.should_remove() {
                request.retain_dominated(&dominated);
            }
        }
        self.dom_lock_request_queue.retain(|r| !r.should_remove());

        // Rebuild the per-context queues for the new dominated set,
        // preserving dominator-queue order and notification state.
        self.event_order_queue = dominated
            .iter()
            .map(|c| (c.clone(), Vec::new()))
            .collect();
        let requests: Vec<(OrderId, LockKind, bool, Vec<EventOperationInfo>)> = self
            .dom_lock_request_queue
            .iter()
            .map(|r| (r.event_id, r.kind, r.notified, r.ops.clone()))
            .collect();
        for (event, kind, notified, ops) in requests {
            if kind == LockKind::DLock {
                continue;
            }
            for op in ops {
                // An op whose target left the region waits for its forward.
                if self.includes_context(&op.to_context) {
                    self.enqueue_event_order_queue(view, &op);
                }
            }
            if notified {
                for queue in self.event_order_queue.values_mut() {
                    for entry in queue.iter_mut() {
                        if entry.event_id == event {
                            entry.notified = true;
                        }
                    }
                }
            }
        }

        if self.dominate_contexts.is_empty() {
            assert!(
                self.dom_lock_request_queue.is_empty(),
                "requests stranded on a demoted dominator {}",
                self.context_name
            );
        }
        forward_ops
    }

    // ---- update fan-out bookkeeping -----------------------------------

    pub fn add_update_source(&mut self, ctx: impl Into<ContextName>) {
        self.update_source_contexts.insert(ctx.into());
    }

    pub fn add_update_waiting(&mut self, ctx: impl Into<ContextName>) {
        let ctx = ctx.into();
        if ctx != self.context_name {
            self.update_waiting_contexts.insert(ctx);
        }
    }

    pub fn remove_update_waiting(&mut self, ctx: &str) {
        self.update_waiting_contexts.remove(ctx);
    }

    pub fn is_waiting_update_replies(&self) -> bool {
        !self.update_waiting_contexts.is_empty()
    }

    pub fn set_update_reply_ops(&mut self, ops: Vec<EventOperationInfo>) {
        self.update_reply_ops = ops;
    }

    pub fn add_update_reply_op(&mut self, op: EventOperationInfo) {
        if !self.update_reply_ops.contains(&op) {
            self.update_reply_ops.push(op);
        }
    }

    pub fn take_update_reply_ops(&mut self) -> Vec<EventOperationInfo> {
        std::mem::take(&mut self.update_reply_ops)
    }

    pub fn take_update_sources(&mut self) -> BTreeSet<ContextName> {
        std::mem::take(&mut self.update_source_contexts)
    }

    #[cfg(test)]
    pub(crate) fn queue_len(&self, ctx: &str) -> usize {
        self.event_order_queue.get(ctx).map_or(0, Vec::len)
    }

    #[cfg(test)]
    pub(crate) fn dom_queue_len(&self) -> usize {
        self.dom_lock_request_queue.len()
    }
}
