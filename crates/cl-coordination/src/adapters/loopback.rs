//! In-process transport wiring service instances together.
//!
//! Each registered service plays one "node". Sends are delivered on a fresh
//! task, so a handler triggering further sends never re-enters itself; the
//! same decoupling a real wire gives.

use crate::application::service::ContextCoordinationService;
use crate::domain::errors::CoordinationError;
use crate::ports::inbound::CoordinationApi;
use crate::ports::outbound::MessageSender;
use async_trait::async_trait;
use shared_types::{Envelope, NodeAddr, ProtocolMessage};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use tracing::warn;

#[derive(Default)]
pub struct LoopbackTransport {
    services: Mutex<HashMap<NodeAddr, Weak<ContextCoordinationService>>>,
}

impl LoopbackTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, addr: NodeAddr, service: &Arc<ContextCoordinationService>) {
        self.services
            .lock()
            .unwrap()
            .insert(addr, Arc::downgrade(service));
    }
}

#[async_trait]
impl MessageSender for LoopbackTransport {
    async fn send(
        &self,
        dest: NodeAddr,
        message: Envelope<ProtocolMessage>,
    ) -> Result<(), CoordinationError> {
        let service = self
            .services
            .lock()
            .unwrap()
            .get(&dest)
            .and_then(Weak::upgrade)
            .ok_or_else(|| CoordinationError::Transport(format!("no node at {dest}")))?;
        tokio::spawn(async move {
            if let Err(err) = service.receive(message).await {
                warn!(%err, "message handling failed");
            }
        });
        Ok(())
    }
}
