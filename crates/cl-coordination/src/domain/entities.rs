//! Work items flowing through a context's three pipelines.

use serde::{Deserialize, Serialize};
use shared_types::{AccessKind, ContextName, EventOperationInfo, EventRecord, OrderId};

/// A create-pipeline entry: an event waiting for its create ticket to be
/// served before it may be initialized.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreateWork {
    pub event_id: OrderId,
    pub target_context: ContextName,
    pub access: AccessKind,
    pub method: String,
    pub payload: Vec<u8>,
}

/// An execute-pipeline entry: a fully-routed event waiting for ticket-order
/// admission into this context.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecuteWork {
    pub event_id: OrderId,
    pub record: EventRecord,
}

/// A commit-pipeline entry, indexed by the event's execute ticket.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommitWork {
    pub event_id: OrderId,
    /// True when the event committed in its target context (as opposed to a
    /// commit-done notification from elsewhere).
    pub is_async: bool,
}

/// An event parked in the waiting area until its dominator grant arrives.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredEvent {
    pub op: EventOperationInfo,
    pub record: EventRecord,
}
