//! Orchestration of the coordination protocols.
//!
//! The service owns the context registry, the keyed waiter registries, and
//! the outbound ports. Domain state is only touched while holding the owning
//! context's mutex; every cross-context effect leaves as a message, even
//! between two contexts hosted on the same node.

use crate::application::dispatch::{CommitJob, CreateJob, DispatchPools, ExecuteJob};
use crate::config::CoordinationConfig;
use crate::domain::context::{Context, ContextParams, ReadyToCommit};
use crate::domain::context_lock::{AccessMode, Acquire};
use crate::domain::dominator::DominatorOutcome;
use crate::domain::entities::{CreateWork, ExecuteWork, StoredEvent};
use crate::domain::errors::CoordinationError;
use crate::ports::inbound::CoordinationApi;
use crate::ports::outbound::{MappingStore, MessageSender, RuntimeUpcall, StructureEdit, StructureView};
use async_trait::async_trait;
use shared_types::{
    AccessKind, ContextName, DeferredMessage, Envelope, EventOpKind, EventOperationInfo,
    EventRecord, MappingSnapshot, MigrationControlKind, NodeAddr, OrderId, ProtocolMessage,
    SubEventRequest,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex as StdMutex, OnceLock};
use tokio::sync::{oneshot, Mutex, RwLock};
use tracing::{debug, error, info, warn};

/// Identity of one operation for keyed waits: the same event issues many
/// operations, told apart by op ticket and target.
type OpKey = (OrderId, u64, ContextName);

fn op_key(op: &EventOperationInfo) -> OpKey {
    (op.event_id, op.ticket, op.to_context.clone())
}

type ContextCell = Arc<Mutex<Context>>;

/// Observable per-context state, for operators and tests.
#[derive(Clone, Debug)]
pub struct ContextStatus {
    pub name: ContextName,
    pub id: u32,
    pub now_serving_execute: u64,
    pub execute_now_committing: u64,
    pub num_readers: u32,
    pub num_writers: u32,
    pub pending_execute: usize,
    pub pending_commit: usize,
    pub migrating: bool,
}

pub struct ContextCoordinationService {
    cfg: CoordinationConfig,
    self_addr: NodeAddr,
    contexts: RwLock<HashMap<ContextName, ContextCell>>,
    structure: Arc<dyn StructureEdit>,
    mapping: Arc<dyn MappingStore>,
    sender: Arc<dyn MessageSender>,
    upcall: Arc<dyn RuntimeUpcall>,
    pools: OnceLock<DispatchPools>,

    /// Blocked permission requests, woken by the dominator's first reply.
    permission_waiters: StdMutex<HashMap<OpKey, oneshot::Sender<Vec<ContextName>>>>,
    /// Blocked request/reply operations (ownership ops, context creation).
    ack_waiters: StdMutex<HashMap<OpKey, oneshot::Sender<u32>>>,
    /// Migration prepare-acks keyed by the migration event's create ticket.
    migration_acks: StdMutex<HashMap<u64, oneshot::Sender<()>>>,

    /// Messages held for contexts in flight between nodes, in arrival order.
    held_messages: StdMutex<HashMap<ContextName, Vec<Envelope<ProtocolMessage>>>>,
    /// Contexts leaving this node.
    migrating_contexts: StdMutex<BTreeSet<ContextName>>,
    /// Contexts announced but not yet arrived here.
    incoming_contexts: StdMutex<BTreeSet<ContextName>>,
}

impl ContextCoordinationService {
    pub fn new(
        cfg: CoordinationConfig,
        self_addr: NodeAddr,
        structure: Arc<dyn StructureEdit>,
        mapping: Arc<dyn MappingStore>,
        sender: Arc<dyn MessageSender>,
        upcall: Arc<dyn RuntimeUpcall>,
    ) -> Arc<Self> {
        let service = Arc::new(Self {
            cfg,
            self_addr,
            contexts: RwLock::new(HashMap::new()),
            structure,
            mapping,
            sender,
            upcall,
            pools: OnceLock::new(),
            permission_waiters: StdMutex::new(HashMap::new()),
            ack_waiters: StdMutex::new(HashMap::new()),
            migration_acks: StdMutex::new(HashMap::new()),
            held_messages: StdMutex::new(HashMap::new()),
            migrating_contexts: StdMutex::new(BTreeSet::new()),
            incoming_contexts: StdMutex::new(BTreeSet::new()),
        });
        let pools = DispatchPools::spawn(&service.cfg, Arc::downgrade(&service));
        service
            .pools
            .set(pools)
            .expect("dispatch pools initialized once");
        service
    }

    pub fn self_addr(&self) -> &NodeAddr {
        &self.self_addr
    }

    /// Snapshot of a hosted context's observable counters.
    pub async fn context_status(&self, name: &str) -> Result<ContextStatus, CoordinationError> {
        let ctx = self.context(name).await?;
        let guard = ctx.lock().await;
        Ok(ContextStatus {
            name: guard.name.clone(),
            id: guard.id,
            now_serving_execute: guard.lock.now_serving_execute(),
            execute_now_committing: guard.booth.execute_now_committing(),
            num_readers: guard.lock.num_readers(),
            num_writers: guard.lock.num_writers(),
            pending_execute: guard.pending_execute(),
            pending_commit: guard.pending_commit(),
            migrating: guard.is_migrating(),
        })
    }

    fn pools(&self) -> &DispatchPools {
        self.pools.get().expect("dispatch pools initialized")
    }

    /// Tear down the worker pools. Keyed waiters drain with errors.
    pub fn shutdown(&self) {
        if let Some(pools) = self.pools.get() {
            pools.shutdown();
        }
    }

    async fn context(&self, name: &str) -> Result<ContextCell, CoordinationError> {
        self.contexts
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| CoordinationError::UnknownContext(name.to_string()))
    }

    async fn send_to_node(
        &self,
        node: NodeAddr,
        message: ProtocolMessage,
    ) -> Result<(), CoordinationError> {
        self.sender
            .send(node, Envelope::new(self.self_addr.clone(), message))
            .await
    }

    async fn send_to_context(
        &self,
        context: &str,
        message: ProtocolMessage,
    ) -> Result<(), CoordinationError> {
        let node = self
            .mapping
            .resolve(context)
            .ok_or_else(|| CoordinationError::UnknownContext(context.to_string()))?;
        self.send_to_node(node, message).await
    }

    // =================================================================
    // Create pipeline
    // =================================================================

    async fn pump_create(&self, name: &str) -> Result<(), CoordinationError> {
        let ctx = self.context(name).await?;
        loop {
            let work = { ctx.lock().await.ready_create() };
            match work {
                Some(work) => {
                    self.pools()
                        .dispatch_create(CreateJob {
                            context: name.to_string(),
                            work,
                        })
                        .await?;
                }
                None => return Ok(()),
            }
        }
    }

    /// Create worker body: wait for the create turn, initialize the event,
    /// advance the serving counter, and route the event to its target.
    pub(crate) async fn run_create(&self, job: CreateJob) -> Result<(), CoordinationError> {
        let ctx = self.context(&job.context).await?;
        let event_id = job.work.event_id;

        loop {
            let turn = {
                ctx.lock()
                    .await
                    .booth
                    .begin_create(event_id.ticket)
            };
            match turn {
                crate::domain::ticket_booth::CreateTurn::Ready => break,
                crate::domain::ticket_booth::CreateTurn::Wait(rx) => {
                    rx.await.map_err(|_| CoordinationError::DispatchStopped)?;
                }
            }
        }

        // Operation ticket 0 is reserved for the event's own execution in
        // its target; nested operations count from 1.
        let op = EventOperationInfo::new(
            event_id,
            EventOpKind::Async,
            job.work.access,
            job.work.target_context.clone(),
            job.work.target_context.clone(),
            0,
        )
        .with_method(job.work.method.clone());

        let record = EventRecord {
            event_id,
            kind: EventOpKind::Async,
            access: job.work.access,
            create_context: job.context.clone(),
            target_context: job.work.target_context.clone(),
            op,
            method: job.work.method,
            payload: job.work.payload,
        };

        {
            ctx.lock().await.booth.finish_create();
        }
        self.pump_create(&job.context).await?;
        self.deliver_event(record).await
    }

    async fn deliver_event(&self, record: EventRecord) -> Result<(), CoordinationError> {
        let dest = record.op.to_context.clone();
        self.send_to_context(
            &dest,
            ProtocolMessage::EventDelivery {
                dest_context: dest.clone(),
                event: record,
            },
        )
        .await
    }

    // =================================================================
    // Execute pipeline
    // =================================================================

    async fn pump_execute(&self, name: &str) -> Result<(), CoordinationError> {
        let ctx = self.context(name).await?;
        loop {
            let work = { ctx.lock().await.ready_execute() };
            match work {
                Some(work) => {
                    self.pools()
                        .dispatch_execute(ExecuteJob {
                            context: name.to_string(),
                            work,
                        })
                        .await?;
                }
                None => return Ok(()),
            }
        }
    }

    /// Execute worker body: ticket-ordered lock acquisition, the application
    /// upcall, then the unlock/release protocol.
    pub(crate) async fn run_execute(&self, job: ExecuteJob) -> Result<(), CoordinationError> {
        let ctx = self.context(&job.context).await?;
        let event = job.work.event_id;
        let record = job.work.record;
        let mode = match record.access {
            AccessKind::Read => AccessMode::Read,
            _ => AccessMode::Write,
        };

        loop {
            let attempt = {
                let mut guard = ctx.lock().await;
                let ticket = guard
                    .order
                    .ticket_of(&event)
                    .unwrap_or_else(|| panic!("event {event} admitted without a ticket"));
                let committing = guard.booth.execute_now_committing();
                guard.lock.try_acquire(event, ticket, mode, committing)
            };
            match attempt {
                Acquire::Granted { advanced } => {
                    if advanced {
                        self.pump_execute(&job.context).await?;
                    }
                    break;
                }
                Acquire::Reentrant => break,
                Acquire::Wait(rx) => {
                    rx.await.map_err(|_| CoordinationError::DispatchStopped)?;
                }
            }
        }

        self.upcall
            .execute_event(&job.context, event, &record.method, &record.payload)
            .await?;

        let mut op = record.op.clone();
        if !op.has_accessed(&job.context) {
            op.add_accessed_context(job.context.clone());
        }

        if record.kind == EventOpKind::Async && record.target_context == job.context {
            // The event's own execution in its target: the whole context is
            // released toward the dominator.
            let name = job.context.clone();
            self.release_context_walk(&name, event, &name, &name, Vec::new(), Vec::new())
                .await
        } else {
            self.unlock_operation(&job.context, op, Vec::new(), Vec::new(), &job.context)
                .await
        }
    }

    // =================================================================
    // Event intake
    // =================================================================

    async fn handle_event_delivery(
        &self,
        dest: ContextName,
        record: EventRecord,
    ) -> Result<(), CoordinationError> {
        let ctx = self.context(&dest).await?;
        let mut op = record.op.clone();
        op.require_context = dest.clone();

        {
            let mut guard = ctx.lock().await;
            guard.booth.message_started();
            let mut record = record;
            record.op.require_context = dest.clone();
            guard.store_waiting_event(StoredEvent {
                op: op.clone(),
                record,
            });
        }

        // The drain counter must come back down even when the permission
        // check fails, or a later migration drain never completes.
        let granted = match self.check_execute_permission(&dest, &op, true).await {
            Ok(granted) => granted,
            Err(err) => {
                ctx.lock().await.booth.message_finished();
                return Err(err);
            }
        };

        {
            let mut guard = ctx.lock().await;
            guard.booth.message_finished();
            if granted {
                debug!(context = %dest, event = %op.event_id, "granted on intake");
                guard.promote_event(op.event_id);
            }
        }
        if granted {
            self.pump_execute(&dest).await?;
        }
        Ok(())
    }

    /// Re-derive a context's dominator state when the structure replica has
    /// moved past it. Operations whose governing dominator changed are
    /// returned for re-submission.
    fn refresh_dominator_if_stale(&self, guard: &mut Context) -> Vec<EventOperationInfo> {
        let view = self.structure.as_view();
        if guard.dominator.version() == view.current_version() {
            return Vec::new();
        }
        let forwarded = guard.dominator.update_dominator(view);
        guard.clear_permit_caches();
        forwarded
    }

    async fn resubmit_forwarded_ops(
        &self,
        ops: Vec<EventOperationInfo>,
    ) -> Result<(), CoordinationError> {
        for op in ops {
            let Some(dominator) = self.structure.dominator_of(&op.require_context) else {
                warn!(%op, "no dominator for forwarded operation");
                continue;
            };
            self.send_to_context(
                &dominator,
                ProtocolMessage::PermissionRequest {
                    dest_context: dominator.clone(),
                    op,
                },
            )
            .await?;
        }
        Ok(())
    }

    /// Whether `op` may enter its target right now. Checks the cache, the
    /// local dominator, or asks the remote dominator and waits for its first
    /// reply.
    async fn check_execute_permission(
        &self,
        ctx_name: &str,
        op: &EventOperationInfo,
        add_permits: bool,
    ) -> Result<bool, CoordinationError> {
        let ctx = self.context(ctx_name).await?;
        let (forwarded, local) = {
            let mut guard = ctx.lock().await;
            let forwarded = self.refresh_dominator_if_stale(&mut guard);
            let dominator = self
                .structure
                .dominator_of(&op.require_context)
                .ok_or_else(|| CoordinationError::UnknownContext(op.require_context.clone()))?;

            if dominator != guard.name && add_permits {
                guard.add_permit_contexts(op.event_id, op.permit_contexts.clone());
            }

            let local = if op.require_context == guard.name
                && guard.permit_cached(&op.event_id, &op.to_context)
            {
                debug!(context = %guard.name, %op, "grant served from cache");
                if op.from_context == guard.name {
                    guard.info_mut(op.event_id).add_event_op(op.clone());
                }
                Some(true)
            } else if dominator == guard.name {
                let view = self.structure.as_view();
                let permits = guard.dominator.check_execute_permission(view, op);
                let granted = permits.contains(&op.to_context);
                if guard.name == op.require_context {
                    guard.add_permit_contexts(op.event_id, permits);
                }
                Some(granted)
            } else {
                None
            };
            (forwarded, local)
        };
        self.resubmit_forwarded_ops(forwarded).await?;
        if let Some(granted) = local {
            return Ok(granted);
        }

        // Remote dominator: blocking request keyed by the operation.
        let dominator = self
            .structure
            .dominator_of(&op.require_context)
            .expect("checked above");
        let permits = self.request_permission(&dominator, op).await?;
        Ok(permits.contains(&op.to_context))
    }

    async fn request_permission(
        &self,
        dominator: &str,
        op: &EventOperationInfo,
    ) -> Result<Vec<ContextName>, CoordinationError> {
        let (tx, rx) = oneshot::channel();
        self.permission_waiters
            .lock()
            .unwrap()
            .insert(op_key(op), tx);
        self.send_to_context(
            dominator,
            ProtocolMessage::PermissionRequest {
                dest_context: dominator.to_string(),
                op: op.clone(),
            },
        )
        .await?;
        rx.await.map_err(|_| CoordinationError::DispatchStopped)
    }

    async fn handle_permission_request(
        &self,
        dest: ContextName,
        op: EventOperationInfo,
    ) -> Result<(), CoordinationError> {
        let ctx = self.context(&dest).await?;
        let (forwarded, permits): (_, Vec<ContextName>) = {
            let mut guard = ctx.lock().await;
            let forwarded = self.refresh_dominator_if_stale(&mut guard);
            let view = self.structure.as_view();
            let permits = guard
                .dominator
                .check_execute_permission(view, &op)
                .into_iter()
                .collect();
            (forwarded, permits)
        };
        self.resubmit_forwarded_ops(forwarded).await?;
        self.send_to_context(
            &op.require_context.clone(),
            ProtocolMessage::PermissionReply {
                dest_context: op.require_context.clone(),
                src_context: dest,
                event_id: op.event_id,
                permitted_contexts: permits,
                ops: vec![op],
            },
        )
        .await
    }

    async fn handle_permission_reply(
        &self,
        dest: ContextName,
        event: OrderId,
        permitted: Vec<ContextName>,
        ops: Vec<EventOperationInfo>,
    ) -> Result<(), CoordinationError> {
        // Blocked requesters first.
        let mut remaining = Vec::new();
        {
            let mut waiters = self.permission_waiters.lock().unwrap();
            for op in ops {
                if let Some(tx) = waiters.remove(&op_key(&op)) {
                    let _ = tx.send(permitted.clone());
                } else {
                    remaining.push(op);
                }
            }
        }
        if remaining.is_empty() {
            return Ok(());
        }

        let ctx = self.context(&dest).await?;
        let mut promote = false;
        {
            let mut guard = ctx.lock().await;
            guard.add_permit_contexts(event, permitted);
            for op in &remaining {
                if op.to_context == guard.name {
                    guard.promote_event(event);
                    promote = true;
                } else {
                    warn!(context = %dest, %op, "grant for an operation not parked here");
                }
            }
        }
        if promote {
            self.pump_execute(&dest).await?;
        }
        Ok(())
    }

    // =================================================================
    // Nested operations issued while an event executes
    // =================================================================

    /// Issue a routine/broadcast access from `from_context` into `target`.
    /// The delivery routes to the target, whose dominator serializes it.
    pub async fn submit_nested_event(
        &self,
        from_context: &str,
        event: OrderId,
        kind: EventOpKind,
        access: AccessKind,
        target: &str,
        method: &str,
        payload: Vec<u8>,
    ) -> Result<(), CoordinationError> {
        assert!(
            matches!(kind, EventOpKind::Routine | EventOpKind::Broadcast),
            "nested submissions are routine or broadcast"
        );
        let ctx = self.context(from_context).await?;
        let record = {
            let mut guard = ctx.lock().await;
            let ticket = guard.next_op_ticket(event);
            let mut op = EventOperationInfo::new(event, kind, access, from_context, target, ticket)
                .with_method(method);
            op.add_accessed_context(from_context.to_string());

            let info = guard.info_mut(event);
            let global_target = info.target_context.clone();
            info.add_to_context(target.to_string());
            info.add_event_op(op.clone());
            info.enqueue_local_lock_request(op.clone());
            EventRecord {
                event_id: event,
                kind,
                access,
                create_context: from_context.to_string(),
                target_context: global_target,
                op,
                method: method.to_string(),
                payload,
            }
        };
        self.deliver_event(record).await
    }

    /// Park a sub-event on the executing context; it enters the create
    /// pipeline when the event commits.
    pub async fn enqueue_sub_event(
        &self,
        context: &str,
        event: OrderId,
        request: SubEventRequest,
    ) -> Result<(), CoordinationError> {
        let ctx = self.context(context).await?;
        ctx.lock().await.info_mut(event).enqueue_sub_event(request);
        Ok(())
    }

    /// Park an outbound application message until the event commits.
    pub async fn defer_message(
        &self,
        context: &str,
        event: OrderId,
        message: DeferredMessage,
    ) -> Result<(), CoordinationError> {
        let ctx = self.context(context).await?;
        ctx.lock()
            .await
            .info_mut(event)
            .enqueue_deferred_message(message);
        Ok(())
    }

    // =================================================================
    // Unlock / release protocol
    // =================================================================

    /// Walk an operation's unlock from the context it ran in up to the
    /// governing dominator, absorbing held requests along the access path.
    /// `src_context` is the walk's previous hop; the context the operation
    /// ran in passes itself when it starts the walk.
    async fn unlock_operation(
        &self,
        ctx_name: &str,
        op: EventOperationInfo,
        mut handed_reqs: Vec<EventOperationInfo>,
        mut handed_ctxs: Vec<ContextName>,
        src_context: &str,
    ) -> Result<(), CoordinationError> {
        let ctx = self.context(ctx_name).await?;
        let event = op.event_id;

        {
            let mut guard = ctx.lock().await;

            // Starting hop only: when the walk later re-enters the target
            // (the target is its own dominator), the dominator branch below
            // must take it instead.
            if op.to_context == guard.name
                && op.from_context != guard.name
                && src_context == guard.name
            {
                // The op ran here: hand held state toward the issuer.
                assert!(handed_reqs.is_empty() && handed_ctxs.is_empty());
                let mut reqs = Vec::new();
                let mut locked = Vec::new();
                if !self.structure.is_dominator(&guard.name) {
                    let info = guard.info_mut(event);
                    reqs = info.local_lock_requests();
                    locked = info.locked_children();
                    info.clear_local_lock_requests();
                    info.clear_locked_children();
                }
                let from = op.from_context.clone();
                drop(guard);
                return self
                    .send_to_context(
                        &from,
                        ProtocolMessage::UnlockContext {
                            dest_context: from.clone(),
                            op,
                            local_lock_requests: reqs,
                            locked_contexts: locked,
                            src_context: ctx_name.to_string(),
                        },
                    )
                    .await;
            }

            // On the access path: absorb the held request, keep walking.
            if op.has_accessed(&guard.name) && op.to_context != guard.name && guard.has_info(&event)
            {
                let absorbed =
                    guard
                        .info_mut(event)
                        .local_unlock(&op, &handed_reqs, &handed_ctxs);
                if absorbed {
                    debug!(context = %guard.name, %op, "held request absorbed");
                    handed_reqs.clear();
                    handed_ctxs.clear();
                }
            }

            let dominator = self
                .structure
                .dominator_of(&op.require_context)
                .ok_or_else(|| CoordinationError::UnknownContext(op.require_context.clone()))?;

            if dominator == guard.name {
                let view = self.structure.as_view();
                let mut out = DominatorOutcome::default();
                for req in &handed_reqs {
                    guard.dominator.check_execute_permission(view, req);
                }
                if !handed_ctxs.is_empty() {
                    guard.dominator.add_locked_contexts(event, handed_ctxs);
                }
                if !guard.dominator.unlock_context(view, &op, &mut out) {
                    guard.dominator.add_waiting_unlock(op.clone());
                }
                if !handed_reqs.is_empty() {
                    guard.dominator.unlock_waiting_requests(view, event, &mut out);
                }
                drop(guard);
                self.notify_released_contexts(ctx_name, event, &out.release_contexts)
                    .await?;
                return self.notify_next_execution_events(ctx_name, out).await;
            }

            // Walk up: prior context on the access path, or the dominator.
            let next = if op.has_accessed(&guard.name) {
                let prior = op.prior_accessed_context(&guard.name);
                if prior.is_empty() {
                    dominator
                } else {
                    prior
                }
            } else {
                dominator
            };
            drop(guard);
            self.send_to_context(
                &next,
                ProtocolMessage::UnlockContext {
                    dest_context: next.clone(),
                    op,
                    local_lock_requests: handed_reqs,
                    locked_contexts: handed_ctxs,
                    src_context: ctx_name.to_string(),
                },
            )
            .await
        }
    }

    /// An event is done with `locked_context` for good: hand the context's
    /// held grants up and release it at the dominator.
    async fn release_context_walk(
        &self,
        ctx_name: &str,
        event: OrderId,
        locked_context: &str,
        src_context: &str,
        handed_reqs: Vec<EventOperationInfo>,
        handed_ctxs: Vec<ContextName>,
    ) -> Result<(), CoordinationError> {
        let ctx = self.context(ctx_name).await?;
        let dominator = self
            .structure
            .dominator_of(locked_context)
            .ok_or_else(|| CoordinationError::UnknownContext(locked_context.to_string()))?;
        let src_dominator = self
            .structure
            .dominator_of(src_context)
            .ok_or_else(|| CoordinationError::UnknownContext(src_context.to_string()))?;

        let mut guard = ctx.lock().await;
        if locked_context == guard.name {
            assert!(handed_reqs.is_empty() && handed_ctxs.is_empty());
            let info = guard.info_mut(event);
            let local_reqs = info.local_lock_requests();
            let mut locked = info.locked_children();
            locked.push(ctx_name.to_string());
            info.clear_local_lock_requests();
            info.clear_locked_children();

            if dominator == guard.name {
                let view = self.structure.as_view();
                let mut out = DominatorOutcome::default();
                for req in &local_reqs {
                    guard.dominator.check_execute_permission(view, req);
                }
                guard.dominator.add_locked_contexts(event, locked);
                if !local_reqs.is_empty() {
                    guard.dominator.unlock_waiting_requests(view, event, &mut out);
                }
                guard
                    .dominator
                    .release_context(view, event, locked_context, &src_dominator, &mut out);
                drop(guard);
                self.notify_released_contexts(ctx_name, event, &out.release_contexts)
                    .await?;
                return self.notify_next_execution_events(ctx_name, out).await;
            }
            drop(guard);
            return self
                .send_to_context(
                    &dominator,
                    ProtocolMessage::ReleaseContext {
                        dest_context: dominator.clone(),
                        event_id: event,
                        locked_context: locked_context.to_string(),
                        local_lock_requests: local_reqs,
                        locked_contexts: locked,
                        src_context: ctx_name.to_string(),
                    },
                )
                .await;
        }

        assert_eq!(
            dominator, guard.name,
            "release routed to a non-dominator context"
        );
        let view = self.structure.as_view();
        let mut out = DominatorOutcome::default();
        for req in &handed_reqs {
            guard.dominator.check_execute_permission(view, req);
        }
        if !handed_ctxs.is_empty() {
            guard.dominator.add_locked_contexts(event, handed_ctxs);
        }
        if !handed_reqs.is_empty() {
            guard.dominator.unlock_waiting_requests(view, event, &mut out);
        }
        guard
            .dominator
            .release_context(view, event, locked_context, &src_dominator, &mut out);
        drop(guard);
        self.notify_released_contexts(ctx_name, event, &out.release_contexts)
            .await?;
        self.notify_next_execution_events(ctx_name, out).await
    }

    /// Fan released contexts out: dominators get a full release, ordinary
    /// contexts drop the local lock.
    async fn notify_released_contexts(
        &self,
        dominator_name: &str,
        event: OrderId,
        releases: &[ContextName],
    ) -> Result<(), CoordinationError> {
        if !releases.is_empty() {
            debug!(dominator = %dominator_name, %event, ?releases, "releasing contexts");
        }
        for released in releases {
            if released != dominator_name && self.structure.is_dominator(released) {
                self.send_to_context(
                    released,
                    ProtocolMessage::ReleaseContext {
                        dest_context: released.clone(),
                        event_id: event,
                        locked_context: released.clone(),
                        local_lock_requests: Vec::new(),
                        locked_contexts: Vec::new(),
                        src_context: dominator_name.to_string(),
                    },
                )
                .await?;
            } else {
                self.send_to_context(
                    released,
                    ProtocolMessage::ReleaseLockOnContext {
                        dest_context: released.clone(),
                        src_context: dominator_name.to_string(),
                        event_id: event,
                    },
                )
                .await?;
            }
        }
        Ok(())
    }

    /// Forward fresh grants to the contexts that required them.
    async fn notify_next_execution_events(
        &self,
        dominator_name: &str,
        out: DominatorOutcome,
    ) -> Result<(), CoordinationError> {
        for (require_context, ops) in out.permitted_ops {
            let mut by_event: BTreeMap<OrderId, Vec<EventOperationInfo>> = BTreeMap::new();
            for op in ops {
                by_event.entry(op.event_id).or_default().push(op);
            }
            for (event, ops) in by_event {
                let permitted = out
                    .permitted_contexts
                    .get(&event)
                    .cloned()
                    .expect("granted event has permitted contexts");
                self.send_to_context(
                    &require_context,
                    ProtocolMessage::PermissionReply {
                        dest_context: require_context.clone(),
                        src_context: dominator_name.to_string(),
                        event_id: event,
                        permitted_contexts: permitted,
                        ops,
                    },
                )
                .await?;
            }
        }
        Ok(())
    }

    async fn handle_release_lock_on_context(
        &self,
        dest: ContextName,
        event: OrderId,
    ) -> Result<(), CoordinationError> {
        let ctx = self.context(&dest).await?;
        let advanced = {
            let mut guard = ctx.lock().await;
            if guard.lock.holds(&event) {
                let ticket = guard
                    .order
                    .ticket_of(&event)
                    .unwrap_or_else(|| panic!("lock holder {event} has no ticket in {dest}"));
                guard.lock.release(event, ticket)
            } else {
                warn!(context = %dest, %event, "release for a lock not held");
                false
            }
        };
        if advanced {
            self.pump_execute(&dest).await?;
        }
        self.handle_ready_to_commit(&dest, event).await
    }

    // =================================================================
    // Commit fan-in and commit pipeline
    // =================================================================

    async fn handle_ready_to_commit(
        &self,
        ctx_name: &str,
        event: OrderId,
    ) -> Result<(), CoordinationError> {
        let ctx = self.context(ctx_name).await?;
        let decision = {
            let mut guard = ctx.lock().await;
            if !guard.has_info(&event) {
                // Already committed here.
                return Ok(());
            }
            let decision = guard.ready_to_commit(&event);
            if let ReadyToCommit::CommitLocal = decision {
                guard.enqueue_commit(event, true)?;
            }
            decision
        };
        match decision {
            ReadyToCommit::StillLocked | ReadyToCommit::Waiting => Ok(()),
            ReadyToCommit::CommitLocal => self.pump_commit(ctx_name).await,
            ReadyToCommit::Notify {
                from_contexts,
                executed_contexts,
            } => {
                let executed: Vec<ContextName> = executed_contexts.into_iter().collect();
                for from in from_contexts {
                    self.send_to_context(
                        &from,
                        ProtocolMessage::ReadyToCommitNotify {
                            event_id: event,
                            to_context: ctx_name.to_string(),
                            dest_contexts: vec![from.clone()],
                            executed_contexts: executed.clone(),
                        },
                    )
                    .await?;
                }
                Ok(())
            }
        }
    }

    async fn handle_ready_to_commit_notify(
        &self,
        event: OrderId,
        to_context: ContextName,
        dest_contexts: Vec<ContextName>,
        executed_contexts: Vec<ContextName>,
    ) -> Result<(), CoordinationError> {
        for dest in dest_contexts {
            let ctx = self.context(&dest).await?;
            {
                let mut guard = ctx.lock().await;
                guard.handle_ready_to_commit_notify(event, &to_context, executed_contexts.clone());
            }
            self.handle_ready_to_commit(&dest, event).await?;
        }
        Ok(())
    }

    async fn pump_commit(&self, name: &str) -> Result<(), CoordinationError> {
        let ctx = self.context(name).await?;
        loop {
            let work = { ctx.lock().await.ready_commit() };
            match work {
                Some(work) => {
                    self.pools()
                        .dispatch_commit(CommitJob {
                            context: name.to_string(),
                            work,
                        })
                        .await?;
                }
                None => return Ok(()),
            }
        }
    }

    /// Commit worker body: release deferred work, drop the event's state,
    /// and fan commit-done out to every context it executed in.
    pub(crate) async fn run_commit(&self, job: CommitJob) -> Result<(), CoordinationError> {
        let ctx = self.context(&job.context).await?;
        let event = job.work.event_id;

        let (sub_events, deferred, executed) = {
            let mut guard = ctx.lock().await;
            let sub_events = guard.take_sub_events(&event);
            let deferred = guard.take_deferred_messages(&event);
            let executed: Vec<ContextName> = guard
                .info(&event)
                .map(|i| i.to_contexts_copy().iter().cloned().collect())
                .unwrap_or_default();
            guard.commit_event(&event)?;
            (sub_events, deferred, executed)
        };
        info!(context = %job.context, %event, "committed");

        // The watermark may have advanced past queued commits.
        self.pump_commit(&job.context).await?;

        if job.work.is_async {
            let executed_set: BTreeSet<ContextName> = executed.iter().cloned().collect();
            for dest in &executed {
                if dest == &job.context {
                    continue;
                }
                self.send_to_context(
                    dest,
                    ProtocolMessage::CommitDone {
                        dest_context: dest.clone(),
                        src_context: job.context.clone(),
                        event_id: event,
                        executed_contexts: executed_set.clone(),
                    },
                )
                .await?;
            }
        }

        for sub in sub_events {
            self.submit_event(
                &job.context,
                &sub.target_context.clone(),
                AccessKind::Write,
                &sub.method.clone(),
                sub.payload,
            )
            .await?;
        }
        for message in deferred {
            let dest = message.dest.clone();
            self.send_to_node(dest, ProtocolMessage::DeferredDelivery { message })
                .await?;
        }
        Ok(())
    }

    async fn handle_commit_done(
        &self,
        dest: ContextName,
        event: OrderId,
    ) -> Result<(), CoordinationError> {
        let ctx = self.context(&dest).await?;
        {
            let mut guard = ctx.lock().await;
            if let Err(err) = guard.enqueue_commit(event, false) {
                error!(context = %dest, %event, %err, "commit-done for unknown event");
                return Ok(());
            }
        }
        self.pump_commit(&dest).await
    }

    // =================================================================
    // Ownership-DAG modification (DLOCK protocol)
    // =================================================================

    /// Accumulate an ownership edit on the executing event.
    pub async fn record_ownership_change(
        &self,
        context: &str,
        event: OrderId,
        add: bool,
        parent: &str,
        child: &str,
    ) -> Result<(), CoordinationError> {
        let ctx = self.context(context).await?;
        let mut guard = ctx.lock().await;
        let ticket = guard.next_op_ticket(event);
        let kind = if add {
            EventOpKind::AddOwnership
        } else {
            EventOpKind::RemoveOwnership
        };
        let mut op =
            EventOperationInfo::new(event, kind, AccessKind::Ownership, parent, child, ticket);
        op.set_dag_version(parent.to_string(), self.structure.dag_version(parent));
        op.set_dag_version(child.to_string(), self.structure.dag_version(child));
        guard.enqueue_ownership_op(event, op);
        Ok(())
    }

    /// Flush the event's accumulated ownership edits through the governing
    /// dominator and block until they are applied everywhere.
    pub async fn apply_ownership_changes(
        &self,
        context: &str,
        event: OrderId,
    ) -> Result<(), CoordinationError> {
        let ctx = self.context(context).await?;
        let (eop, ops) = {
            let mut guard = ctx.lock().await;
            let ops = guard.take_ownership_ops(&event);
            if ops.is_empty() {
                return Ok(());
            }
            let ticket = guard.next_op_ticket(event);
            let mut eop = EventOperationInfo::new(
                event,
                EventOpKind::AddOwnership,
                AccessKind::Ownership,
                context,
                context,
                ticket,
            );
            for op in &ops {
                for (name, version) in &op.dag_versions {
                    eop.set_dag_version(name.clone(), *version);
                }
            }
            guard.set_current_ownership_op(eop.clone());
            (eop, ops)
        };

        let all_governed = {
            let view = self.structure.as_view();
            ops.iter().all(|o| {
                view.is_elder_context(context, &o.to_context) || !view.connects_to_root(&o.to_context)
            })
        };
        let dominator = if all_governed && self.structure.is_dominator(context) {
            context.to_string()
        } else {
            self.structure
                .dominator_of(context)
                .ok_or_else(|| CoordinationError::UnknownContext(context.to_string()))?
        };

        let (tx, rx) = oneshot::channel();
        self.ack_waiters.lock().unwrap().insert(op_key(&eop), tx);
        self.send_to_context(
            &dominator,
            ProtocolMessage::OwnershipOperations {
                dest_context: dominator.clone(),
                op: eop,
                src_context: context.to_string(),
                ops,
            },
        )
        .await?;
        rx.await.map_err(|_| CoordinationError::DispatchStopped)?;
        Ok(())
    }

    async fn handle_ownership_operations(
        &self,
        dest: ContextName,
        eop: EventOperationInfo,
        src: ContextName,
        ops: Vec<EventOperationInfo>,
    ) -> Result<(), CoordinationError> {
        let view = self.structure.as_view();
        let governs_all = ops.iter().all(|o| {
            view.is_elder_context(&dest, &o.to_context) || !view.connects_to_root(&o.to_context)
        });
        if !(governs_all && self.structure.is_dominator(&dest)) {
            let dominator = self
                .structure
                .dominator_of(&dest)
                .ok_or_else(|| CoordinationError::UnknownContext(dest.clone()))?;
            if dominator != dest {
                debug!(context = %dest, %eop, "forwarding structural ops to dominator");
                return self
                    .send_to_context(
                        &dominator,
                        ProtocolMessage::OwnershipOperations {
                            dest_context: dominator.clone(),
                            op: eop,
                            src_context: src,
                            ops,
                        },
                    )
                    .await;
            }
        }

        // Refresh stale DAG knowledge before touching the structure.
        let ctx = self.context(&dest).await?;
        let mut stale: BTreeMap<NodeAddr, BTreeSet<ContextName>> = BTreeMap::new();
        {
            let mut guard = ctx.lock().await;
            for (name, version) in &eop.dag_versions {
                let local = self.structure.dag_version(name);
                if local == 0 || local < *version {
                    let node = self
                        .mapping
                        .resolve(name)
                        .ok_or_else(|| CoordinationError::UnknownContext(name.clone()))?;
                    stale.entry(node).or_default().insert(name.clone());
                    guard.dominator.add_update_waiting(name.clone());
                }
            }
            if !stale.is_empty() {
                let mut pending = vec![eop.clone()];
                pending.extend(ops.iter().cloned());
                guard.dominator.set_update_reply_ops(pending);
                guard.dominator.add_update_source(src.clone());
            }
        }
        if !stale.is_empty() {
            for (node, contexts) in stale {
                self.send_to_node(
                    node.clone(),
                    ProtocolMessage::DagRequest {
                        dest: node,
                        requesting_context: dest.clone(),
                        contexts,
                    },
                )
                .await?;
            }
            return Ok(());
        }

        self.execute_ownership_operations(&dest, eop, src, ops).await
    }

    async fn execute_ownership_operations(
        &self,
        ctx_name: &str,
        eop: EventOperationInfo,
        src: ContextName,
        ops: Vec<EventOperationInfo>,
    ) -> Result<(), CoordinationError> {
        let changes: Vec<(bool, ContextName, ContextName)> = ops
            .iter()
            .map(|o| {
                (
                    o.kind == Some(EventOpKind::AddOwnership),
                    o.from_context.clone(),
                    o.to_context.clone(),
                )
            })
            .collect();
        let affected = self.structure.apply_ownership_changes(&changes);
        assert!(
            self.structure.is_dominator(ctx_name),
            "structural change demoted its own dominator {ctx_name}"
        );
        info!(context = %ctx_name, ?affected, "ownership DAG updated");

        let pairs = self.structure.ownership_pairs_of(&affected);
        let mut versions: BTreeMap<ContextName, u64> = BTreeMap::new();
        for (parent, child) in &pairs {
            versions.insert(parent.clone(), self.structure.dag_version(parent));
            versions.insert(child.clone(), self.structure.dag_version(child));
        }
        for name in &affected {
            versions.insert(name.clone(), self.structure.dag_version(name));
        }

        // Contexts named by the change but hosted nowhere yet come up here.
        for name in &affected {
            if !self.mapping.has_context(name) {
                self.mapping_place_local(name).await?;
            }
        }

        let ctx = self.context(ctx_name).await?;
        let mut fan_out: BTreeMap<NodeAddr, BTreeSet<ContextName>> = BTreeMap::new();
        let (forward_ops, waiting) = {
            let mut guard = ctx.lock().await;
            guard.dominator.add_update_source(src);
            guard.dominator.add_update_reply_op(eop);
            let forward_ops = guard.dominator.update_dominator(self.structure.as_view());
            guard.clear_permit_caches();
            for name in &affected {
                if name == ctx_name {
                    continue;
                }
                let node = self
                    .mapping
                    .resolve(name)
                    .ok_or_else(|| CoordinationError::UnknownContext(name.clone()))?;
                fan_out.entry(node).or_default().insert(name.clone());
                guard.dominator.add_update_waiting(name.clone());
            }
            (forward_ops, guard.dominator.is_waiting_update_replies())
        };

        for (node, contexts) in fan_out {
            self.send_to_node(
                node.clone(),
                ProtocolMessage::UpdateDominators {
                    dest: node,
                    src_context: ctx_name.to_string(),
                    dest_contexts: contexts,
                    forward_ops: forward_ops.clone(),
                    ownership_pairs: pairs.clone(),
                    versions: versions.clone(),
                },
            )
            .await?;
        }

        if !waiting {
            self.finish_ownership_update(ctx_name).await?;
        }
        Ok(())
    }

    async fn mapping_place_local(&self, name: &str) -> Result<(), CoordinationError> {
        let type_name = name.split(['[', '.']).next().unwrap_or(name).to_string();
        self.host_context(name, &type_name).await?;
        Ok(())
    }

    async fn finish_ownership_update(&self, ctx_name: &str) -> Result<(), CoordinationError> {
        let ctx = self.context(ctx_name).await?;
        let (sources, mut reply_ops) = {
            let mut guard = ctx.lock().await;
            (
                guard.dominator.take_update_sources(),
                guard.dominator.take_update_reply_ops(),
            )
        };
        if reply_ops.is_empty() {
            return Ok(());
        }
        let eop = reply_ops.remove(0);
        for src in sources {
            self.send_to_context(
                &src,
                ProtocolMessage::OwnershipOperationsReply {
                    dest_context: src.clone(),
                    op: eop.clone(),
                },
            )
            .await?;
        }
        Ok(())
    }

    async fn handle_update_dominators(
        &self,
        src_context: ContextName,
        dest_contexts: BTreeSet<ContextName>,
        forward_ops: Vec<EventOperationInfo>,
        pairs: Vec<(ContextName, ContextName)>,
        versions: BTreeMap<ContextName, u64>,
    ) -> Result<(), CoordinationError> {
        self.structure.update_ownership_pairs(&pairs, &versions);

        let mut collected = Vec::new();
        let mut updated: BTreeSet<ContextName> = BTreeSet::new();
        let mut granted: Vec<(ContextName, EventOperationInfo, Vec<ContextName>)> = Vec::new();
        for dest in &dest_contexts {
            let Ok(ctx) = self.context(dest).await else {
                warn!(context = %dest, "dominator update for a context not hosted here");
                continue;
            };
            let mut guard = ctx.lock().await;
            let view = self.structure.as_view();
            let mut reply_ops = guard.dominator.update_dominator(view);
            guard.clear_permit_caches();

            let pre = guard.dominator.pre_dominator().to_string();
            let cur = guard.dominator.cur_dominator().to_string();
            if pre == guard.name && cur != guard.name {
                // Demoted: report the structural event's held children so
                // the new dominator can adopt them.
                if let Some(cop) = guard.current_ownership_op().cloned() {
                    if let Some(info) = guard.info(&cop.event_id) {
                        for locked in info.locked_children() {
                            let mut op = EventOperationInfo::new(
                                cop.event_id,
                                EventOpKind::Async,
                                AccessKind::Write,
                                guard.name.clone(),
                                locked,
                                cop.ticket,
                            );
                            op.require_context = guard.name.clone();
                            reply_ops.push(op);
                        }
                    }
                }
            } else if pre != guard.name && cur == guard.name {
                // Promoted into a dominator: adopt forwarded operations now
                // governed here. An operation grantable straight away must
                // still reach its requester, who is blocked on the original
                // request.
                for op in &forward_ops {
                    if view.dominator_of(&op.require_context).as_deref() == Some(guard.name.as_str())
                        || op.to_context == guard.name
                    {
                        let permits = guard.dominator.check_execute_permission(view, op);
                        if permits.contains(&op.to_context) {
                            granted.push((
                                guard.name.clone(),
                                op.clone(),
                                permits.into_iter().collect(),
                            ));
                        }
                    }
                }
            }
            collected.extend(reply_ops);
            updated.insert(dest.clone());
        }

        for (granting, op, permits) in granted {
            self.send_to_context(
                &op.require_context.clone(),
                ProtocolMessage::PermissionReply {
                    dest_context: op.require_context.clone(),
                    src_context: granting,
                    event_id: op.event_id,
                    permitted_contexts: permits,
                    ops: vec![op],
                },
            )
            .await?;
        }

        self.send_to_context(
            &src_context,
            ProtocolMessage::UpdateDominatorsReply {
                dest_context: src_context.clone(),
                src_contexts: updated,
                ops: collected,
            },
        )
        .await
    }

    async fn handle_update_dominators_reply(
        &self,
        dest: ContextName,
        src_contexts: BTreeSet<ContextName>,
        ops: Vec<EventOperationInfo>,
    ) -> Result<(), CoordinationError> {
        let ctx = self.context(&dest).await?;
        let waiting = {
            let mut guard = ctx.lock().await;
            let view = self.structure.as_view();
            for op in &ops {
                // Children a demoted dominator held for an event already
                // registered here are recorded; anything else is adopted as
                // a held request.
                if guard.dominator.has_request(op.event_id) {
                    guard
                        .dominator
                        .add_locked_context(op.event_id, op.to_context.clone());
                } else if guard.dominator.includes_context(&op.to_context) {
                    guard.dominator.check_execute_permission(view, op);
                } else {
                    warn!(context = %dest, %op, "held context reported for an event unknown here");
                }
            }
            for src in &src_contexts {
                guard.dominator.remove_update_waiting(src);
            }
            guard.dominator.is_waiting_update_replies()
        };
        if !waiting {
            self.finish_ownership_update(&dest).await?;
        }
        Ok(())
    }

    async fn handle_dag_request(
        &self,
        requesting_context: ContextName,
        contexts: BTreeSet<ContextName>,
    ) -> Result<(), CoordinationError> {
        let pairs = self.structure.ownership_pairs_of(&contexts);
        let mut versions = BTreeMap::new();
        for name in &contexts {
            versions.insert(name.clone(), self.structure.dag_version(name));
        }
        self.send_to_context(
            &requesting_context,
            ProtocolMessage::DagReply {
                dest_context: requesting_context.clone(),
                contexts,
                ownership_pairs: pairs,
                versions,
            },
        )
        .await
    }

    async fn handle_dag_reply(
        &self,
        dest: ContextName,
        contexts: BTreeSet<ContextName>,
        pairs: Vec<(ContextName, ContextName)>,
        versions: BTreeMap<ContextName, u64>,
    ) -> Result<(), CoordinationError> {
        self.structure.update_ownership_pairs(&pairs, &versions);
        let ctx = self.context(&dest).await?;
        let (waiting, pending, sources) = {
            let mut guard = ctx.lock().await;
            for name in &contexts {
                guard.dominator.remove_update_waiting(name);
            }
            if guard.dominator.is_waiting_update_replies() {
                (true, Vec::new(), BTreeSet::new())
            } else {
                (
                    false,
                    guard.dominator.take_update_reply_ops(),
                    guard.dominator.take_update_sources(),
                )
            }
        };
        if waiting || pending.is_empty() {
            return Ok(());
        }
        let mut pending = pending;
        let eop = pending.remove(0);
        let src = sources
            .into_iter()
            .next()
            .expect("structural request has a source");
        // Sources get re-registered by the execution pass.
        Box::pin(self.execute_ownership_operations(&dest, eop, src, pending)).await
    }

    async fn handle_ownership_operations_reply(
        &self,
        op: EventOperationInfo,
    ) -> Result<(), CoordinationError> {
        if let Some(tx) = self.ack_waiters.lock().unwrap().remove(&op_key(&op)) {
            let _ = tx.send(0);
        } else {
            warn!(%op, "structural reply with no waiter");
        }
        Ok(())
    }

    // =================================================================
    // Child-context creation
    // =================================================================

    /// Create a fresh child context under `parent` from inside an event.
    /// Returns the new context's name; the ownership edge is accumulated and
    /// applied with the event's other structural edits.
    pub async fn create_child_context(
        &self,
        parent: &str,
        event: OrderId,
        context_type: &str,
    ) -> Result<ContextName, CoordinationError> {
        let ctx = self.context(parent).await?;
        let op = {
            let mut guard = ctx.lock().await;
            let ticket = guard.next_op_ticket(event);
            EventOperationInfo::new(
                event,
                EventOpKind::Async,
                AccessKind::Write,
                parent,
                parent,
                ticket,
            )
        };
        let (tx, rx) = oneshot::channel();
        self.ack_waiters.lock().unwrap().insert(op_key(&op), tx);
        self.send_to_node(
            self.mapping.head(),
            ProtocolMessage::CreateNewContext {
                op: op.clone(),
                src_context: parent.to_string(),
                context_type: context_type.to_string(),
            },
        )
        .await?;
        let new_id = rx.await.map_err(|_| CoordinationError::DispatchStopped)?;
        let name = format!("{context_type}[{new_id}]");

        {
            let mut guard = ctx.lock().await;
            guard.info_mut(event).set_new_context_id(new_id);
        }
        self.host_context(&name, context_type).await?;
        self.record_ownership_change(parent, event, true, parent, &name)
            .await?;
        Ok(name)
    }

    async fn handle_create_new_context(
        &self,
        sender: NodeAddr,
        op: EventOperationInfo,
        src_context: ContextName,
        context_type: String,
    ) -> Result<(), CoordinationError> {
        // Allocation is the head's job.
        assert_eq!(self.mapping.head(), self.self_addr, "id allocation off-head");
        let id = self.mapping.allocate_id();
        let name = format!("{context_type}[{id}]");
        self.mapping.place_at(&name, id, sender.clone());
        debug!(context = %name, id, node = %sender, "child context allocated");
        self.send_to_context(
            &src_context,
            ProtocolMessage::CreateNewContextReply {
                dest_context: src_context.clone(),
                op,
                new_context_id: id,
            },
        )
        .await
    }

    async fn handle_create_new_context_reply(
        &self,
        op: EventOperationInfo,
        new_context_id: u32,
    ) -> Result<(), CoordinationError> {
        if let Some(tx) = self.ack_waiters.lock().unwrap().remove(&op_key(&op)) {
            let _ = tx.send(new_context_id);
        } else {
            warn!(%op, "create-context reply with no waiter");
        }
        Ok(())
    }

    // =================================================================
    // Migration
    // =================================================================

    async fn migrate_context_inner(
        &self,
        name: &ContextName,
        dest: NodeAddr,
    ) -> Result<(), CoordinationError> {
        let ctx = self.context(name).await?;
        let (event, execute_ticket, contexts_map) = {
            let mut guard = ctx.lock().await;
            if guard.is_migrating() {
                return Err(CoordinationError::Migrating(name.clone()));
            }
            let create_ticket = guard.booth.new_create_ticket();
            let event = OrderId::new(guard.id, create_ticket);
            guard.mark_migration_ticket(create_ticket);
            let execute_ticket = guard.order.assign(event);
            guard.set_migrating(true);
            let mut contexts_map = BTreeMap::new();
            contexts_map.insert(guard.id, guard.name.clone());
            (event, execute_ticket, contexts_map)
        };
        self.migrating_contexts
            .lock()
            .unwrap()
            .insert(name.clone());
        info!(context = %name, %event, node = %dest, "migration starting");

        // Destination must hold our messages before anything else moves.
        let (tx, rx) = oneshot::channel();
        self.migration_acks
            .lock()
            .unwrap()
            .insert(event.ticket, tx);
        let snapshot = self.mapping.snapshot();
        self.send_to_node(
            dest.clone(),
            ProtocolMessage::MigrationControl {
                kind: MigrationControlKind::PrepareRecv,
                ticket: event.ticket,
                contexts: contexts_map.clone(),
                mapping: snapshot.clone(),
                src: self.self_addr.clone(),
            },
        )
        .await?;
        rx.await.map_err(|_| CoordinationError::DispatchStopped)?;

        self.send_to_node(
            self.mapping.head(),
            ProtocolMessage::MigrationControl {
                kind: MigrationControlKind::ReleaseMapping,
                ticket: event.ticket,
                contexts: contexts_map.clone(),
                mapping: snapshot.clone(),
                src: self.self_addr.clone(),
            },
        )
        .await?;
        self.send_to_node(
            dest.clone(),
            ProtocolMessage::MigrationControl {
                kind: MigrationControlKind::UpdateMapping,
                ticket: event.ticket,
                contexts: contexts_map,
                mapping: snapshot,
                src: self.self_addr.clone(),
            },
        )
        .await?;

        // Exclusive entry at the commit watermark: the context is quiesced.
        loop {
            let attempt = {
                let mut guard = ctx.lock().await;
                let committing = guard.booth.execute_now_committing();
                guard
                    .lock
                    .try_acquire(event, execute_ticket, AccessMode::Migration, committing)
            };
            match attempt {
                Acquire::Granted { .. } | Acquire::Reentrant => break,
                Acquire::Wait(rx) => {
                    rx.await.map_err(|_| CoordinationError::DispatchStopped)?;
                }
            }
        }

        // Drain in-flight messages, then in-flight create events.
        let drain_started = std::time::Instant::now();
        loop {
            let rx = { ctx.lock().await.booth.wait_messages_drained() };
            match rx {
                Some(rx) => rx.await.map_err(|_| CoordinationError::DispatchStopped)?,
                None => break,
            }
        }
        loop {
            let rx = { ctx.lock().await.booth.wait_creates_drained() };
            match rx {
                Some(rx) => rx.await.map_err(|_| CoordinationError::DispatchStopped)?,
                None => break,
            }
        }
        if drain_started.elapsed().as_secs() > self.cfg.migration_drain_warn_secs {
            warn!(
                context = %name,
                elapsed_secs = drain_started.elapsed().as_secs(),
                "migration drain ran long"
            );
        }
        debug!(context = %name, "drained; exporting");

        let state = self.upcall.snapshot_state(name).await?;
        let params = { ctx.lock().await.export_params() };
        let bytes = bincode::serialize(&params)
            .map_err(|e| CoordinationError::Protocol(shared_types::ProtocolError::Decode(e.to_string())))?;

        self.contexts.write().await.remove(name);

        self.send_to_node(
            dest,
            ProtocolMessage::TransferContext {
                params: bytes,
                state,
                event_id: event,
            },
        )
        .await
    }

    async fn handle_transfer_context(
        &self,
        src: NodeAddr,
        params: Vec<u8>,
        state: Vec<u8>,
        event: OrderId,
    ) -> Result<(), CoordinationError> {
        let params: ContextParams = bincode::deserialize(&params)
            .map_err(|e| CoordinationError::Protocol(shared_types::ProtocolError::Decode(e.to_string())))?;
        let name = params.name.clone();
        info!(context = %name, %event, from = %src, "context arriving");

        self.upcall.restore_state(&name, &state).await?;

        let mut context = Context::from_params(params);
        context.set_migrating(false);
        let ticket = context
            .order
            .ticket_of(&event)
            .unwrap_or_else(|| panic!("migration event {event} lost its ticket"));
        context.lock.release(event, ticket);
        context
            .commit_event(&event)
            .expect("migration event commits exactly once");

        self.contexts
            .write()
            .await
            .insert(name.clone(), Arc::new(Mutex::new(context)));
        self.mapping.relocate(&name, self.self_addr.clone());

        // Resume both admission pipelines on the new node.
        self.pump_execute(&name).await?;
        self.pump_create(&name).await?;
        self.pump_commit(&name).await?;

        self.send_to_node(
            self.mapping.head(),
            ProtocolMessage::CommitMigration {
                event_id: event,
                context: name,
                src,
                dest: self.self_addr.clone(),
            },
        )
        .await
    }

    async fn handle_commit_migration(
        &self,
        event: OrderId,
        context: ContextName,
        src: NodeAddr,
        dest: NodeAddr,
    ) -> Result<(), CoordinationError> {
        assert_eq!(self.mapping.head(), self.self_addr, "migration commit off-head");
        self.mapping.relocate(&context, dest.clone());
        let snapshot = self.mapping.snapshot();
        let mut contexts = BTreeMap::new();
        if let Some(id) = self.mapping.context_id_of(&context) {
            contexts.insert(id, context.clone());
        }
        for node in [src, dest] {
            self.send_to_node(
                node,
                ProtocolMessage::MigrationControl {
                    kind: MigrationControlKind::Done,
                    ticket: event.ticket,
                    contexts: contexts.clone(),
                    mapping: snapshot.clone(),
                    src: self.self_addr.clone(),
                },
            )
            .await?;
        }
        Ok(())
    }

    async fn handle_migration_control(
        &self,
        kind: MigrationControlKind,
        ticket: u64,
        contexts: BTreeMap<u32, ContextName>,
        mapping: MappingSnapshot,
        src: NodeAddr,
    ) -> Result<(), CoordinationError> {
        match kind {
            MigrationControlKind::PrepareRecv => {
                self.mapping.update_to(&mapping);
                {
                    let mut incoming = self.incoming_contexts.lock().unwrap();
                    for name in contexts.values() {
                        incoming.insert(name.clone());
                    }
                }
                self.send_to_node(
                    src,
                    ProtocolMessage::MigrationControl {
                        kind: MigrationControlKind::PrepareRecvAck,
                        ticket,
                        contexts,
                        mapping: self.mapping.snapshot(),
                        src: self.self_addr.clone(),
                    },
                )
                .await
            }
            MigrationControlKind::PrepareRecvAck => {
                if let Some(tx) = self.migration_acks.lock().unwrap().remove(&ticket) {
                    let _ = tx.send(());
                }
                Ok(())
            }
            MigrationControlKind::UpdateMapping | MigrationControlKind::ReleaseMapping => {
                self.mapping.update_to(&mapping);
                Ok(())
            }
            MigrationControlKind::Done => {
                self.mapping.update_to(&mapping);
                let mut held = Vec::new();
                {
                    let mut migrating = self.migrating_contexts.lock().unwrap();
                    let mut incoming = self.incoming_contexts.lock().unwrap();
                    let mut buffers = self.held_messages.lock().unwrap();
                    for name in contexts.values() {
                        migrating.remove(name);
                        incoming.remove(name);
                        if let Some(messages) = buffers.remove(name) {
                            held.push((name.clone(), messages));
                        }
                    }
                }
                // Held messages chase the context, in arrival order.
                for (name, messages) in held {
                    let node = self
                        .mapping
                        .resolve(&name)
                        .ok_or_else(|| CoordinationError::UnknownContext(name.clone()))?;
                    info!(context = %name, count = messages.len(), "releasing held messages");
                    for envelope in messages {
                        self.sender.send(node.clone(), envelope).await?;
                    }
                }
                Ok(())
            }
        }
    }

    // =================================================================
    // Message dispatch
    // =================================================================

    fn should_hold(&self, message: &ProtocolMessage) -> Option<ContextName> {
        let dest = message.dest_context()?;
        let migrating = self.migrating_contexts.lock().unwrap().contains(dest);
        let incoming = self.incoming_contexts.lock().unwrap().contains(dest);
        if migrating || incoming {
            Some(dest.clone())
        } else {
            None
        }
    }

    async fn dispatch_message(
        &self,
        envelope: Envelope<ProtocolMessage>,
    ) -> Result<(), CoordinationError> {
        let sender = envelope.sender.clone();
        match envelope.payload {
            ProtocolMessage::EventDelivery { dest_context, event } => {
                self.handle_event_delivery(dest_context, event).await
            }
            ProtocolMessage::PermissionRequest { dest_context, op } => {
                self.handle_permission_request(dest_context, op).await
            }
            ProtocolMessage::PermissionReply {
                dest_context,
                event_id,
                permitted_contexts,
                ops,
                ..
            } => {
                self.handle_permission_reply(dest_context, event_id, permitted_contexts, ops)
                    .await
            }
            ProtocolMessage::UnlockContext {
                dest_context,
                op,
                local_lock_requests,
                locked_contexts,
                src_context,
            } => {
                self.unlock_operation(
                    &dest_context,
                    op,
                    local_lock_requests,
                    locked_contexts,
                    &src_context,
                )
                .await
            }
            ProtocolMessage::ReleaseContext {
                dest_context,
                event_id,
                locked_context,
                local_lock_requests,
                locked_contexts,
                src_context,
            } => {
                self.release_context_walk(
                    &dest_context,
                    event_id,
                    &locked_context,
                    &src_context,
                    local_lock_requests,
                    locked_contexts,
                )
                .await
            }
            ProtocolMessage::ReleaseLockOnContext {
                dest_context,
                event_id,
                ..
            } => self.handle_release_lock_on_context(dest_context, event_id).await,
            ProtocolMessage::EnqueueSubEvent { dest_context, op, request } => {
                self.enqueue_sub_event(&dest_context, op.event_id, request).await?;
                self.send_to_context(
                    &op.from_context.clone(),
                    ProtocolMessage::EnqueueSubEventReply {
                        dest_context: op.from_context.clone(),
                        op,
                    },
                )
                .await
            }
            ProtocolMessage::EnqueueSubEventReply { op, .. }
            | ProtocolMessage::EnqueueDeferredMessageReply { op, .. }
            | ProtocolMessage::EnqueueOwnershipOpsReply { op, .. } => {
                if let Some(tx) = self.ack_waiters.lock().unwrap().remove(&op_key(&op)) {
                    let _ = tx.send(0);
                }
                Ok(())
            }
            ProtocolMessage::EnqueueDeferredMessage { dest_context, op, message } => {
                self.defer_message(&dest_context, op.event_id, message).await?;
                self.send_to_context(
                    &op.from_context.clone(),
                    ProtocolMessage::EnqueueDeferredMessageReply {
                        dest_context: op.from_context.clone(),
                        op,
                    },
                )
                .await
            }
            ProtocolMessage::EnqueueOwnershipOps { dest_context, op, src_context: _, ops } => {
                let ctx = self.context(&dest_context).await?;
                {
                    let mut guard = ctx.lock().await;
                    for o in ops {
                        guard.enqueue_ownership_op(op.event_id, o);
                    }
                }
                self.send_to_context(
                    &op.from_context.clone(),
                    ProtocolMessage::EnqueueOwnershipOpsReply {
                        dest_context: op.from_context.clone(),
                        op,
                    },
                )
                .await
            }
            ProtocolMessage::OwnershipOperations { dest_context, op, src_context, ops } => {
                self.handle_ownership_operations(dest_context, op, src_context, ops).await
            }
            ProtocolMessage::OwnershipOperationsReply { op, .. } => {
                self.handle_ownership_operations_reply(op).await
            }
            ProtocolMessage::DagRequest { requesting_context, contexts, .. } => {
                self.handle_dag_request(requesting_context, contexts).await
            }
            ProtocolMessage::DagReply {
                dest_context,
                contexts,
                ownership_pairs,
                versions,
            } => {
                self.handle_dag_reply(dest_context, contexts, ownership_pairs, versions)
                    .await
            }
            ProtocolMessage::UpdateDominators {
                src_context,
                dest_contexts,
                forward_ops,
                ownership_pairs,
                versions,
                ..
            } => {
                self.handle_update_dominators(
                    src_context,
                    dest_contexts,
                    forward_ops,
                    ownership_pairs,
                    versions,
                )
                .await
            }
            ProtocolMessage::UpdateDominatorsReply { dest_context, src_contexts, ops } => {
                self.handle_update_dominators_reply(dest_context, src_contexts, ops).await
            }
            ProtocolMessage::CreateNewContext { op, src_context, context_type } => {
                self.handle_create_new_context(sender, op, src_context, context_type).await
            }
            ProtocolMessage::CreateNewContextReply { op, new_context_id, .. } => {
                self.handle_create_new_context_reply(op, new_context_id).await
            }
            ProtocolMessage::CommitDone { dest_context, event_id, .. } => {
                self.handle_commit_done(dest_context, event_id).await
            }
            ProtocolMessage::ReadyToCommitNotify {
                event_id,
                to_context,
                dest_contexts,
                executed_contexts,
            } => {
                self.handle_ready_to_commit_notify(
                    event_id,
                    to_context,
                    dest_contexts,
                    executed_contexts,
                )
                .await
            }
            ProtocolMessage::DeferredDelivery { message } => {
                debug!(dest = %message.dest, channel = message.channel, "deferred delivery");
                Ok(())
            }
            ProtocolMessage::MigrationControl { kind, ticket, contexts, mapping, src } => {
                self.handle_migration_control(kind, ticket, contexts, mapping, src).await
            }
            ProtocolMessage::CommitMigration { event_id, context, src, dest } => {
                self.handle_commit_migration(event_id, context, src, dest).await
            }
            ProtocolMessage::TransferContext { params, state, event_id } => {
                self.handle_transfer_context(sender, params, state, event_id).await
            }
        }
    }
}

#[async_trait]
impl CoordinationApi for ContextCoordinationService {
    async fn host_context(&self, name: &str, type_name: &str) -> Result<u32, CoordinationError> {
        if let Ok(existing) = self.context(name).await {
            return Ok(existing.lock().await.id);
        }
        let id = match self.mapping.context_id_of(name) {
            Some(id) => id,
            None => {
                let id = self.mapping.allocate_id();
                self.mapping.place_at(name, id, self.self_addr.clone());
                id
            }
        };
        let mut context = Context::new(name, type_name, id, 0);
        let dominator = self
            .structure
            .dominator_of(name)
            .unwrap_or_else(|| name.to_string());
        let dominated = self.structure.dominated_set_of(name);
        context.initialize_dominator(dominator, self.structure.current_version(), dominated);
        self.contexts
            .write()
            .await
            .insert(name.to_string(), Arc::new(Mutex::new(context)));
        info!(context = %name, id, "context hosted");
        Ok(id)
    }

    async fn submit_event(
        &self,
        create_context: &str,
        target_context: &str,
        access: AccessKind,
        method: &str,
        payload: Vec<u8>,
    ) -> Result<OrderId, CoordinationError> {
        let ctx = self.context(create_context).await?;
        let event_id = {
            let mut guard = ctx.lock().await;
            let ticket = guard.booth.new_create_ticket();
            let event_id = OrderId::new(guard.id, ticket);
            guard.enqueue_create(CreateWork {
                event_id,
                target_context: target_context.to_string(),
                access,
                method: method.to_string(),
                payload,
            });
            event_id
        };
        self.pump_create(create_context).await?;
        Ok(event_id)
    }

    async fn receive(&self, envelope: Envelope<ProtocolMessage>) -> Result<(), CoordinationError> {
        envelope.check_version()?;
        if let Some(dest) = self.should_hold(&envelope.payload) {
            debug!(context = %dest, "message held during migration");
            self.held_messages
                .lock()
                .unwrap()
                .entry(dest)
                .or_default()
                .push(envelope);
            return Ok(());
        }
        self.dispatch_message(envelope).await
    }

    async fn migrate_context(
        &self,
        context: &ContextName,
        dest: NodeAddr,
    ) -> Result<(), CoordinationError> {
        self.migrate_context_inner(context, dest).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{InMemoryMapping, OwnershipTree};
    use crate::ports::outbound::mocks::{RecordingSender, RecordingUpcall};
    use std::time::Duration;

    fn service_with(sender: Arc<RecordingSender>) -> Arc<ContextCoordinationService> {
        let node = NodeAddr::new("n1");
        ContextCoordinationService::new(
            CoordinationConfig::default(),
            node.clone(),
            Arc::new(OwnershipTree::new("Root")),
            Arc::new(InMemoryMapping::new(node)),
            sender,
            Arc::new(RecordingUpcall::default()),
        )
    }

    #[tokio::test]
    async fn test_host_context_is_idempotent() {
        let service = service_with(Arc::new(RecordingSender::default()));
        let id = service.host_context("Root", "Root").await.unwrap();
        assert_eq!(service.host_context("Root", "Root").await.unwrap(), id);
    }

    #[tokio::test]
    async fn test_submit_event_sells_strictly_increasing_tickets() {
        let service = service_with(Arc::new(RecordingSender::default()));
        service.host_context("Root", "Root").await.unwrap();
        let e1 = service
            .submit_event("Root", "Root", AccessKind::Write, "apply", vec![])
            .await
            .unwrap();
        let e2 = service
            .submit_event("Root", "Root", AccessKind::Write, "apply", vec![])
            .await
            .unwrap();
        assert!(e1.ticket < e2.ticket);
        assert_eq!(e1.context_id, e2.context_id);
    }

    #[tokio::test]
    async fn test_created_event_routes_to_its_target() {
        let sender = Arc::new(RecordingSender::default());
        let service = service_with(sender.clone());
        service.host_context("Root", "Root").await.unwrap();
        let event = service
            .submit_event("Root", "Root", AccessKind::Write, "apply", vec![])
            .await
            .unwrap();

        // The create worker runs asynchronously; wait for the delivery.
        for _ in 0..200 {
            {
                let sent = sender.sent.lock().unwrap();
                if sent.iter().any(|(_, m)| {
                    matches!(
                        m,
                        ProtocolMessage::EventDelivery { event: record, .. }
                            if record.event_id == event
                    )
                }) {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("create pipeline never delivered the event");
    }

    #[tokio::test]
    async fn test_unknown_context_is_reported_not_fatal() {
        let service = service_with(Arc::new(RecordingSender::default()));
        assert!(matches!(
            service
                .submit_event("Nowhere", "Nowhere", AccessKind::Write, "apply", vec![])
                .await,
            Err(CoordinationError::UnknownContext(_))
        ));
        assert!(service.context_status("Nowhere").await.is_err());
    }
}
