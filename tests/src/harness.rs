//! In-process multi-node cluster for coordination scenarios.
//!
//! Every "node" is a full `ContextCoordinationService` wired to the shared
//! loopback transport; the ownership tree and the context mapping are shared
//! replicas, as a fully-synchronized deployment would see them.

use async_trait::async_trait;
use cl_coordination::adapters::{InMemoryMapping, LoopbackTransport, OwnershipTree};
use cl_coordination::ports::outbound::RuntimeUpcall;
use cl_coordination::{ContextCoordinationService, CoordinationConfig, CoordinationError};
use shared_types::{NodeAddr, OrderId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Application upcall that records executions and enforces the one-writer
/// observation: no two write bodies may overlap inside one context.
#[derive(Default)]
pub struct RecordingUpcall {
    pub executed: Mutex<Vec<(String, OrderId, String)>>,
    pub in_flight: AtomicU32,
    pub max_in_flight: AtomicU32,
    pub states: Mutex<HashMap<String, Vec<u8>>>,
    /// Artificial body duration, to widen race windows.
    pub body_delay: Duration,
}

impl RecordingUpcall {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            body_delay: delay,
            ..Self::default()
        }
    }

    pub fn executed_count(&self) -> usize {
        self.executed.lock().unwrap().len()
    }

    pub fn executed_in(&self, context: &str) -> Vec<OrderId> {
        self.executed
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, _, _)| c == context)
            .map(|(_, e, _)| *e)
            .collect()
    }

    /// Poll until `count` bodies have run, or panic after five seconds.
    pub async fn wait_for(&self, count: usize) {
        for _ in 0..500 {
            if self.executed_count() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "timed out waiting for {count} executions, saw {}",
            self.executed_count()
        );
    }
}

#[async_trait]
impl RuntimeUpcall for RecordingUpcall {
    async fn execute_event(
        &self,
        context: &str,
        event_id: OrderId,
        method: &str,
        _payload: &[u8],
    ) -> Result<(), CoordinationError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.body_delay.is_zero() {
            tokio::time::sleep(self.body_delay).await;
        }
        self.executed
            .lock()
            .unwrap()
            .push((context.to_string(), event_id, method.to_string()));
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }

    async fn snapshot_state(&self, context: &str) -> Result<Vec<u8>, CoordinationError> {
        Ok(self
            .states
            .lock()
            .unwrap()
            .get(context)
            .cloned()
            .unwrap_or_default())
    }

    async fn restore_state(&self, context: &str, state: &[u8]) -> Result<(), CoordinationError> {
        self.states
            .lock()
            .unwrap()
            .insert(context.to_string(), state.to_vec());
        Ok(())
    }
}

pub struct TestCluster {
    pub transport: Arc<LoopbackTransport>,
    pub structure: Arc<OwnershipTree>,
    pub mapping: Arc<InMemoryMapping>,
    pub upcall: Arc<RecordingUpcall>,
    pub nodes: HashMap<String, Arc<ContextCoordinationService>>,
}

impl TestCluster {
    /// Build a cluster with the named nodes; the first is the head.
    pub fn new(root_context: &str, node_names: &[&str]) -> Self {
        Self::with_upcall(root_context, node_names, Arc::new(RecordingUpcall::default()))
    }

    pub fn with_upcall(
        root_context: &str,
        node_names: &[&str],
        upcall: Arc<RecordingUpcall>,
    ) -> Self {
        assert!(!node_names.is_empty());
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .try_init();
        let transport = LoopbackTransport::new();
        let structure = Arc::new(OwnershipTree::new(root_context));
        let mapping = Arc::new(InMemoryMapping::new(NodeAddr::new(node_names[0])));

        let mut nodes = HashMap::new();
        for name in node_names {
            let addr = NodeAddr::new(*name);
            let service = ContextCoordinationService::new(
                CoordinationConfig::default(),
                addr.clone(),
                structure.clone(),
                mapping.clone(),
                transport.clone(),
                upcall.clone(),
            );
            transport.register(addr, &service);
            nodes.insert(name.to_string(), service);
        }

        Self {
            transport,
            structure,
            mapping,
            upcall,
            nodes,
        }
    }

    pub fn node(&self, name: &str) -> Arc<ContextCoordinationService> {
        self.nodes.get(name).expect("known node").clone()
    }

    /// Host a context on `node`, optionally under a parent in the tree.
    pub async fn host(&self, node: &str, context: &str, parent: Option<&str>) -> u32 {
        use cl_coordination::CoordinationApi;
        if let Some(parent) = parent {
            self.structure.add_child(parent, context);
        }
        let type_name = context.split(['.', '[']).next().unwrap_or(context);
        self.node(node)
            .host_context(context, type_name)
            .await
            .expect("context hosted")
    }
}
