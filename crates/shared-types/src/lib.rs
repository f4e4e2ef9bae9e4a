//! # Shared Types Crate
//!
//! This crate contains the identifiers, the cross-context operation record,
//! and the node-to-node protocol payloads shared by the coordination crates.
//!
//! ## Design Principles
//!
//! - **Single Source of Truth**: every type that crosses a node boundary is
//!   defined here, once.
//! - **Envelope Integrity**: all node-to-node traffic is wrapped in
//!   `Envelope<T>`; the envelope's `sender` is the sole authority on message
//!   origin.
//! - **Owned payloads**: values are moved across boundaries, never shared.

pub mod entities;
pub mod envelope;
pub mod errors;
pub mod ipc;

pub use entities::*;
pub use envelope::{Envelope, PROTOCOL_VERSION};
pub use errors::*;
pub use ipc::*;
