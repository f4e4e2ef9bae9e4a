//! # Context Coordination Core
//!
//! Decides, for every event flowing through a tree of contexts distributed
//! across nodes, *when* it may create, execute, and commit inside a context,
//! and *which* contexts it is currently permitted to touch.
//!
//! Three intertwined protocols, none of which may deadlock or double-admit:
//!
//! - **Ticket booth**: per-context three-phase sequencing
//!   (create -> execute -> commit), each phase strictly ordered by its own
//!   monotonic ticket counter.
//! - **Context lock**: a reader/writer/migration state machine gating
//!   execution inside one context, with ticket-ordered admission and
//!   exact-waiter wakeups.
//! - **Dominator protocol**: hierarchical permission management that
//!   serializes cross-context access along the ownership DAG, including
//!   virtual locks for ordering and DLOCK serialization of structural
//!   changes, plus live relocation of a context between nodes.
//!
//! ## Architecture
//!
//! - **Domain**: ticket booth, lock state machine, execution order map,
//!   per-event scratch state, dominator queues, the context aggregate,
//!   migration snapshot params
//! - **Ports**: inbound coordination API; outbound mapping/structure views,
//!   message sender, and application upcalls
//! - **Application**: service orchestration and the create/execute/commit
//!   worker pools
//! - **IPC**: message handler dispatching protocol traffic into the service
//! - **Adapters**: in-memory ownership tree, context mapping, and loopback
//!   transport used by the test suite

pub mod adapters;
pub mod application;
pub mod config;
pub mod domain;
pub mod ipc;
pub mod ports;

pub use application::dispatch::DispatchPools;
pub use application::service::ContextCoordinationService;
pub use config::CoordinationConfig;
pub use domain::context::Context;
pub use domain::errors::CoordinationError;
pub use ports::inbound::CoordinationApi;
