//! Configuration for the coordination core.

use serde::{Deserialize, Serialize};

/// Coordination configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CoordinationConfig {
    /// Worker tasks dispatching admitted create events.
    pub create_pool_size: usize,
    /// Worker tasks dispatching admitted execute events.
    pub execute_pool_size: usize,
    /// Worker tasks dispatching admitted commit events.
    pub commit_pool_size: usize,
    /// Bound of each dispatch channel before enqueue backpressure.
    pub dispatch_channel_capacity: usize,
    /// Seconds a migration drain may take before a warning is logged.
    pub migration_drain_warn_secs: u64,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            create_pool_size: 2,
            execute_pool_size: 4,
            commit_pool_size: 2,
            dispatch_channel_capacity: 256,
            migration_drain_warn_secs: 30,
        }
    }
}
