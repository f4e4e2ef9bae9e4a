pub mod loopback;
pub mod mapping;
pub mod ownership_tree;

pub use loopback::LoopbackTransport;
pub use mapping::InMemoryMapping;
pub use ownership_tree::OwnershipTree;
