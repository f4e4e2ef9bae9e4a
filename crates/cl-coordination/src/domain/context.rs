//! The per-context aggregate.
//!
//! A `Context` owns the three ordered pipelines (create, execute, commit),
//! the lock state machine, the execute-order map, its dominator state, and
//! the per-event scratch records. Everything here is synchronous: the
//! service layer holds the context behind a mutex, calls in, and performs
//! the async fan-out the returned values ask for.

use crate::domain::context_lock::{ContextLock, ContextLockParams};
use crate::domain::dominator::Dominator;
use crate::domain::entities::{CommitWork, CreateWork, ExecuteWork, StoredEvent};
use crate::domain::errors::CoordinationError;
use crate::domain::event_order::ExecutionOrder;
use crate::domain::execution_info::EventExecutionInfo;
use crate::domain::ticket_booth::{TicketBooth, TicketBoothParams};
use serde::{Deserialize, Serialize};
use shared_types::{
    AccessKind, ContextName, DeferredMessage, EventOperationInfo, OrderId, SubEventRequest,
};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use tracing::{debug, warn};

/// What the commit fan-in decided for an event.
#[derive(Debug)]
pub enum ReadyToCommit {
    /// The event still holds this context's lock; nothing to do yet.
    StillLocked,
    /// Other contexts are still outstanding.
    Waiting,
    /// This is the target context and all work drained: commit here.
    CommitLocal,
    /// Work drained but the target is elsewhere: notify the contexts this
    /// event came from.
    Notify {
        from_contexts: BTreeSet<ContextName>,
        executed_contexts: BTreeSet<ContextName>,
    },
}

/// Serialized coordination state of a context, shipped on migration next to
/// the application state blob.
#[derive(Debug, Serialize, Deserialize)]
pub struct ContextParams {
    pub name: ContextName,
    pub type_name: String,
    pub id: u32,
    pub service_id: u8,
    pub booth: TicketBoothParams,
    pub lock: ContextLockParams,
    pub order: ExecutionOrder,
    pub dominator: Dominator,
    pub infos: Vec<(OrderId, EventExecutionInfo)>,
    pub waiting_events: Vec<(OrderId, Vec<StoredEvent>)>,
    pub create_queue: BTreeMap<u64, CreateWork>,
    pub execute_queue: VecDeque<ExecuteWork>,
    pub commit_queue: BTreeMap<u64, CommitWork>,
    pub migrating: bool,
    pub current_ownership_op: Option<EventOperationInfo>,
}

#[derive(Debug)]
pub struct Context {
    pub name: ContextName,
    pub type_name: String,
    pub id: u32,
    pub service_id: u8,

    pub booth: TicketBooth,
    pub lock: ContextLock,
    pub order: ExecutionOrder,
    pub dominator: Dominator,

    infos: HashMap<OrderId, EventExecutionInfo>,
    waiting_events: HashMap<OrderId, Vec<StoredEvent>>,

    create_queue: BTreeMap<u64, CreateWork>,
    execute_queue: VecDeque<ExecuteWork>,
    commit_queue: BTreeMap<u64, CommitWork>,

    migrating: bool,
    current_ownership_op: Option<EventOperationInfo>,
}

impl Context {
    pub fn new(
        name: impl Into<ContextName>,
        type_name: impl Into<String>,
        id: u32,
        service_id: u8,
    ) -> Self {
        let name = name.into();
        let mut order = ExecutionOrder::new();
        order.set_context_name(name.clone());
        Self {
            booth: TicketBooth::new(name.clone()),
            lock: ContextLock::new(name.clone()),
            order,
            dominator: Dominator::default(),
            infos: HashMap::new(),
            waiting_events: HashMap::new(),
            create_queue: BTreeMap::new(),
            execute_queue: VecDeque::new(),
            commit_queue: BTreeMap::new(),
            migrating: false,
            current_ownership_op: None,
            type_name: type_name.into(),
            id,
            service_id,
            name,
        }
    }

    pub fn initialize_dominator(
        &mut self,
        dominator: impl Into<ContextName>,
        version: u64,
        dominated: Vec<ContextName>,
    ) {
        self.dominator
            .initialize(self.name.clone(), dominator, version, dominated);
    }

    // ---- execution info -----------------------------------------------

    pub fn info(&self, event: &OrderId) -> Option<&EventExecutionInfo> {
        self.infos.get(event)
    }

    pub fn info_mut(&mut self, event: OrderId) -> &mut EventExecutionInfo {
        self.infos.entry(event).or_default()
    }

    pub fn has_info(&self, event: &OrderId) -> bool {
        self.infos.contains_key(event)
    }

    pub fn set_execution_info(
        &mut self,
        event: OrderId,
        create_context: impl Into<ContextName>,
        target_context: impl Into<ContextName>,
        access: AccessKind,
    ) {
        let info = self.infos.entry(event).or_default();
        info.create_context = create_context.into();
        info.target_context = target_context.into();
        info.access = Some(access);
    }

    pub fn next_op_ticket(&mut self, event: OrderId) -> u64 {
        self.info_mut(event).next_op_ticket()
    }

    // ---- waiting-event intake -----------------------------------------

    /// Park an event until its dominator grant arrives.
    pub fn store_waiting_event(&mut self, stored: StoredEvent) {
        self.waiting_events
            .entry(stored.op.event_id)
            .or_default()
            .push(stored);
    }

    /// Grant arrived: move this event's deliveries addressed to this context
    /// into the execute queue. An event that already holds an execute ticket
    /// here re-enters at the queue head.
    pub fn promote_event(&mut self, event: OrderId) -> usize {
        let Some(mut stored) = self.waiting_events.remove(&event) else {
            warn!(context = %self.name, %event, "no waiting deliveries for event");
            return 0;
        };
        let mut rest = Vec::new();
        let mut promoted = 0;
        for entry in stored.drain(..) {
            if entry.op.to_context != self.name {
                rest.push(entry);
                continue;
            }
            let work = ExecuteWork {
                event_id: entry.record.event_id,
                record: entry.record,
            };
            match self.order.ticket_of(&work.event_id) {
                Some(ticket) => {
                    assert!(
                        ticket <= self.lock.now_serving_execute(),
                        "re-entering event {} does not hold {}",
                        work.event_id,
                        self.name
                    );
                    self.execute_queue.push_front(work);
                }
                None => self.enqueue_execute(work),
            }
            promoted += 1;
        }
        if !rest.is_empty() {
            self.waiting_events.insert(event, rest);
        }
        promoted
    }

    /// Pull a parked broadcast delivery back out for forwarding.
    pub fn take_waiting_delivery(&mut self, op: &EventOperationInfo) -> Option<StoredEvent> {
        let stored = self.waiting_events.get_mut(&op.event_id)?;
        let pos = stored.iter().position(|e| &e.op == op)?;
        let entry = stored.remove(pos);
        if stored.is_empty() {
            self.waiting_events.remove(&op.event_id);
        }
        Some(entry)
    }

    // ---- execute pipeline ---------------------------------------------

    /// Queue a routed event, keeping deliveries of one event adjacent.
    pub fn enqueue_execute(&mut self, work: ExecuteWork) {
        if let Some(pos) = self
            .execute_queue
            .iter()
            .position(|e| e.event_id == work.event_id)
        {
            if pos + 1 < self.execute_queue.len() {
                self.execute_queue.insert(pos + 1, work);
                return;
            }
        }
        self.execute_queue.push_back(work);
    }

    /// The single execute-admission check. Idempotent; run it whenever the
    /// serving counter or the queue head may have changed.
    pub fn ready_execute(&mut self) -> Option<ExecuteWork> {
        let front = self.execute_queue.front()?;
        let event = front.event_id;

        if let Some(ticket) = self.order.ticket_of(&event) {
            // The event executed here before and still holds the context.
            if ticket <= self.lock.now_serving_execute() {
                let work = self.execute_queue.pop_front().expect("front exists");
                let from = work.record.op.from_context.clone();
                self.info_mut(event).add_from_context(from);
                debug!(context = %self.name, %event, ticket, "re-entry admitted");
                return Some(work);
            }
            return None;
        }

        assert!(
            self.order.next_ticket() >= self.lock.now_serving_execute(),
            "execute ticket counter behind serving counter in {}",
            self.name
        );

        // Next fresh event may only be admitted when the ticket it would
        // receive is the one being served.
        if self.order.next_ticket() != self.lock.now_serving_execute() {
            return None;
        }

        let work = self.execute_queue.pop_front().expect("front exists");
        let ticket = self.order.assign(event);
        assert_eq!(
            ticket,
            self.lock.now_serving_execute(),
            "wrong execute ticket assignment in {}",
            self.name
        );

        let record = &work.record;
        self.set_execution_info(
            event,
            record.create_context.clone(),
            record.target_context.clone(),
            record.access,
        );
        let from = record.op.from_context.clone();
        self.info_mut(event).add_from_context(from);
        debug!(context = %self.name, %event, ticket, "execute admitted");
        Some(work)
    }

    // ---- create pipeline ----------------------------------------------

    pub fn enqueue_create(&mut self, work: CreateWork) {
        self.create_queue.insert(work.event_id.ticket, work);
    }

    /// Release the head create event when its ticket is being served. A
    /// migrating context admits nothing.
    pub fn ready_create(&mut self) -> Option<CreateWork> {
        if self.migrating {
            debug!(context = %self.name, "create admission held: migrating");
            return None;
        }
        let (&ticket, _) = self.create_queue.iter().next()?;
        if ticket != self.booth.now_serving_create() {
            return None;
        }
        let work = self.create_queue.remove(&ticket).expect("head exists");
        self.booth.create_dispatched();
        Some(work)
    }

    // ---- commit pipeline ----------------------------------------------

    pub fn enqueue_commit(&mut self, event: OrderId, is_async: bool) -> Result<(), CoordinationError> {
        let ticket = self
            .order
            .ticket_of(&event)
            .ok_or(CoordinationError::NoExecuteTicket(event))?;
        self.commit_queue.insert(ticket, CommitWork { event_id: event, is_async });
        Ok(())
    }

    /// Release the commit entry sitting exactly at the watermark.
    pub fn ready_commit(&mut self) -> Option<CommitWork> {
        let ticket = self.booth.execute_now_committing();
        self.commit_queue.remove(&ticket)
    }

    /// Record the event as committed; returns true when the commit watermark
    /// advanced (a waiting migration event is woken in that case).
    pub fn mark_committed(&mut self, event: &OrderId) -> bool {
        let ticket = self
            .order
            .ticket_of(event)
            .unwrap_or_else(|| panic!("event {event} committed without a ticket in {}", self.name));
        let advanced = self.booth.mark_committed(ticket);
        if advanced && self.migrating {
            self.lock.notify_migration_waiter();
        }
        advanced
    }

    /// Final commit in this context: drop the event's ticket and scratch
    /// state. Committing while still holding the lock is a protocol bug.
    pub fn commit_event(&mut self, event: &OrderId) -> Result<(), CoordinationError> {
        assert!(
            !self.lock.holds(event),
            "event {event} commits while holding {}",
            self.name
        );
        if self.order.ticket_of(event).is_none() {
            warn!(context = %self.name, %event, "commit for unknown event");
            return Err(CoordinationError::NoExecuteTicket(*event));
        }
        self.mark_committed(event);
        self.order.remove(event);
        self.booth.advance_create_committing();
        self.infos.remove(event);
        debug!(context = %self.name, %event, "event committed");
        Ok(())
    }

    pub fn take_sub_events(&mut self, event: &OrderId) -> Vec<SubEventRequest> {
        self.infos
            .get_mut(event)
            .map(EventExecutionInfo::take_sub_events)
            .unwrap_or_default()
    }

    pub fn take_deferred_messages(&mut self, event: &OrderId) -> Vec<DeferredMessage> {
        self.infos
            .get_mut(event)
            .map(EventExecutionInfo::take_deferred_messages)
            .unwrap_or_default()
    }

    // ---- permission cache ---------------------------------------------

    pub fn add_permit_contexts<I, S>(&mut self, event: OrderId, contexts: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<ContextName>,
    {
        let info = self.infos.entry(event).or_default();
        for ctx in contexts {
            info.add_permit_context(ctx);
        }
    }

    pub fn permit_cached(&self, event: &OrderId, ctx: &str) -> bool {
        self.infos
            .get(event)
            .is_some_and(|info| info.permit_cached(ctx))
    }

    /// Dominator changed: every cached grant is stale.
    pub fn clear_permit_caches(&mut self) {
        for info in self.infos.values_mut() {
            info.clear_permit_cache();
        }
    }

    // ---- commit fan-in ------------------------------------------------

    pub fn ready_to_commit(&mut self, event: &OrderId) -> ReadyToCommit {
        if self.lock.holds(event) {
            debug!(context = %self.name, %event, "still locked; commit deferred");
            return ReadyToCommit::StillLocked;
        }
        let name = self.name.clone();
        let info = self
            .infos
            .get_mut(event)
            .unwrap_or_else(|| panic!("no execution info for {event} in {name}"));
        if info.outstanding_to_contexts() > 0 {
            return ReadyToCommit::Waiting;
        }
        info.mark_ready_committed();
        if info.target_context == name {
            ReadyToCommit::CommitLocal
        } else {
            ReadyToCommit::Notify {
                from_contexts: info.from_contexts().clone(),
                executed_contexts: info.to_contexts_copy().clone(),
            }
        }
    }

    /// A context this event fanned out to reports itself drained.
    pub fn handle_ready_to_commit_notify(
        &mut self,
        event: OrderId,
        to_context: &str,
        executed_contexts: Vec<ContextName>,
    ) {
        let info = self
            .infos
            .get_mut(&event)
            .unwrap_or_else(|| panic!("no execution info for {event} in {}", self.name));
        info.erase_to_context(to_context);
        info.add_executed_contexts(executed_contexts);
    }

    // ---- ownership op accumulation ------------------------------------

    pub fn set_current_ownership_op(&mut self, op: EventOperationInfo) {
        self.current_ownership_op = Some(op);
    }

    pub fn current_ownership_op(&self) -> Option<&EventOperationInfo> {
        self.current_ownership_op.as_ref()
    }

    pub fn enqueue_ownership_op(&mut self, event: OrderId, op: EventOperationInfo) {
        self.info_mut(event).enqueue_ownership_op(op);
    }

    pub fn take_ownership_ops(&mut self, event: &OrderId) -> Vec<EventOperationInfo> {
        self.infos
            .get_mut(event)
            .map(EventExecutionInfo::take_ownership_ops)
            .unwrap_or_default()
    }

    // ---- migration ----------------------------------------------------

    pub fn is_migrating(&self) -> bool {
        self.migrating
    }

    pub fn set_migrating(&mut self, flag: bool) {
        self.migrating = flag;
    }

    pub fn mark_migration_ticket(&mut self, ticket: u64) {
        self.booth.mark_migration_ticket(ticket);
    }

    /// Export the coordination state for transfer. The context must be
    /// quiesced; in-flight waiters cannot be serialized and must not exist.
    pub fn export_params(&self) -> ContextParams {
        ContextParams {
            name: self.name.clone(),
            type_name: self.type_name.clone(),
            id: self.id,
            service_id: self.service_id,
            booth: self.booth.params(),
            lock: self.lock.params(),
            order: self.order.clone(),
            dominator: self.dominator.clone(),
            infos: self.infos.iter().map(|(k, v)| (*k, v.clone())).collect(),
            waiting_events: self
                .waiting_events
                .iter()
                .map(|(k, v)| (*k, v.clone()))
                .collect(),
            create_queue: self.create_queue.clone(),
            execute_queue: self.execute_queue.clone(),
            commit_queue: self.commit_queue.clone(),
            migrating: self.migrating,
            current_ownership_op: self.current_ownership_op.clone(),
        }
    }

    /// Rebuild a context on the destination node from transferred params.
    pub fn from_params(params: ContextParams) -> Self {
        let mut order = params.order;
        order.set_context_name(params.name.clone());
        Self {
            booth: TicketBooth::restore(params.name.clone(), params.booth),
            lock: ContextLock::restore(params.name.clone(), params.lock),
            order,
            dominator: params.dominator,
            infos: params.infos.into_iter().collect(),
            waiting_events: params.waiting_events.into_iter().collect(),
            create_queue: params.create_queue,
            execute_queue: params.execute_queue,
            commit_queue: params.commit_queue,
            migrating: params.migrating,
            current_ownership_op: params.current_ownership_op,
            name: params.name,
            type_name: params.type_name,
            id: params.id,
            service_id: params.service_id,
        }
    }

    /// Routed events not yet admitted to execute.
    pub fn pending_execute(&self) -> usize {
        self.execute_queue.len()
    }

    /// Commit entries waiting for the watermark.
    pub fn pending_commit(&self) -> usize {
        self.commit_queue.len()
    }
}
