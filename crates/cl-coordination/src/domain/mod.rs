pub mod context;
pub mod context_lock;
pub mod dominator;
pub mod entities;
pub mod errors;
pub mod event_order;
pub mod execution_info;
pub mod invariants;
pub mod lock_request;
pub mod ticket_booth;

pub use context::{Context, ContextParams};
pub use context_lock::{AccessMode, Acquire, ContextLock};
pub use dominator::{Dominator, DominatorOutcome};
pub use entities::*;
pub use errors::CoordinationError;
pub use event_order::ExecutionOrder;
pub use execution_info::EventExecutionInfo;
pub use lock_request::{DomLockRequest, LockKind, LockRequest};
pub use ticket_booth::{CreateTurn, TicketBooth};
