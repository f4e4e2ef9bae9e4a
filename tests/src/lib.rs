//! # Lattice Test Suite
//!
//! Unified test crate for the coordination core.
//!
//! ## Structure
//!
//! ```text
//! tests/src/
//! ├── harness.rs        # In-process multi-node cluster over the loopback
//! │                     # transport, with a recording application upcall
//! └── integration/      # Cross-node coordination scenarios
//!     ├── pipeline.rs   # Ticket pipelines and lock admission
//!     ├── dominator.rs  # Grant ordering across a governed region
//!     ├── nested.rs     # Nested accesses and the unlock walk
//!     └── migration.rs  # Live relocation and message safety
//! ```
//!
//! ## Running Tests
//!
//! ```bash
//! cargo test -p cl-tests
//! ```

pub mod harness;
pub mod integration;
