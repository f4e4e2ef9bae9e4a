//! Nested accesses: an executing event entering further contexts, with the
//! unlock walking the access path back to the dominator.

#[cfg(test)]
mod tests {
    use crate::harness::RecordingUpcall;
    use async_trait::async_trait;
    use cl_coordination::adapters::{InMemoryMapping, LoopbackTransport, OwnershipTree};
    use cl_coordination::ports::outbound::RuntimeUpcall;
    use cl_coordination::{
        ContextCoordinationService, CoordinationApi, CoordinationConfig, CoordinationError,
    };
    use shared_types::{AccessKind, EventOpKind, NodeAddr, OrderId};
    use std::sync::{Arc, OnceLock, Weak};
    use std::time::Duration;

    /// Upcall whose "spawn_nested" body broadcasts into a child context
    /// before returning, exercising the nested grant and unlock walk.
    struct NestingUpcall {
        service: OnceLock<Weak<ContextCoordinationService>>,
        recorder: RecordingUpcall,
    }

    #[async_trait]
    impl RuntimeUpcall for NestingUpcall {
        async fn execute_event(
            &self,
            context: &str,
            event_id: OrderId,
            method: &str,
            payload: &[u8],
        ) -> Result<(), CoordinationError> {
            if method == "spawn_nested" {
                let service = self
                    .service
                    .get()
                    .and_then(Weak::upgrade)
                    .expect("service wired");
                service
                    .submit_nested_event(
                        context,
                        event_id,
                        EventOpKind::Broadcast,
                        AccessKind::Write,
                        "C.kid",
                        "nested",
                        Vec::new(),
                    )
                    .await?;
            }
            self.recorder
                .execute_event(context, event_id, method, payload)
                .await
        }

        async fn snapshot_state(&self, context: &str) -> Result<Vec<u8>, CoordinationError> {
            self.recorder.snapshot_state(context).await
        }

        async fn restore_state(&self, context: &str, state: &[u8]) -> Result<(), CoordinationError> {
            self.recorder.restore_state(context, state).await
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_broadcast_into_child_drains_and_commits() {
        let node = NodeAddr::new("n1");
        let transport = LoopbackTransport::new();
        let structure = Arc::new(OwnershipTree::new("Root"));
        let mapping = Arc::new(InMemoryMapping::new(node.clone()));
        let upcall = Arc::new(NestingUpcall {
            service: OnceLock::new(),
            recorder: RecordingUpcall::default(),
        });

        let service = ContextCoordinationService::new(
            CoordinationConfig::default(),
            node.clone(),
            structure.clone(),
            mapping,
            transport.clone(),
            upcall.clone(),
        );
        upcall
            .service
            .set(Arc::downgrade(&service))
            .ok()
            .expect("wired once");
        transport.register(node, &service);

        structure.add_child("Root", "C");
        structure.add_child("C", "C.kid");
        service.host_context("Root", "Root").await.unwrap();
        service.host_context("C", "C").await.unwrap();
        service.host_context("C.kid", "C").await.unwrap();

        service
            .submit_event("Root", "C", AccessKind::Write, "spawn_nested", vec![])
            .await
            .expect("submitted");

        // Both bodies run: the parent in C and the broadcast in C.kid.
        upcall.recorder.wait_for(2).await;
        let in_child = upcall.recorder.executed_in("C.kid");
        assert_eq!(in_child.len(), 1);
        let in_parent = upcall.recorder.executed_in("C");
        assert_eq!(in_parent.len(), 1);
        // One event, two contexts.
        assert_eq!(in_child[0], in_parent[0]);

        // Everything drains: locks free, watermarks caught up, region alive.
        for _ in 0..300 {
            let c = service.context_status("C").await.unwrap();
            let kid = service.context_status("C.kid").await.unwrap();
            if c.num_writers == 0
                && kid.num_writers == 0
                && c.pending_commit == 0
                && kid.pending_commit == 0
                && c.execute_now_committing == c.now_serving_execute
                && kid.execute_now_committing == kid.now_serving_execute
            {
                // The region still admits new work after the nested cycle.
                service
                    .submit_event("Root", "C.kid", AccessKind::Write, "apply", vec![])
                    .await
                    .expect("submitted");
                upcall.recorder.wait_for(3).await;
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("nested event never drained");
    }
}
