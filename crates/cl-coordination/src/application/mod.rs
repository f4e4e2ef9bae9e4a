pub mod dispatch;
pub mod service;

pub use dispatch::DispatchPools;
pub use service::{ContextCoordinationService, ContextStatus};
