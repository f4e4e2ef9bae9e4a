//! Live relocation of a context between nodes, including message safety.

#[cfg(test)]
mod tests {
    use crate::harness::{RecordingUpcall, TestCluster};
    use cl_coordination::CoordinationApi;
    use shared_types::{AccessKind, NodeAddr};
    use std::sync::Arc;
    use std::time::Duration;

    /// A quiesced context moves to another node and keeps executing there,
    /// with its ticket counters intact.
    #[tokio::test(flavor = "multi_thread")]
    async fn test_context_migrates_and_resumes() {
        let cluster = TestCluster::new("Root", &["n1", "n2"]);
        cluster.host("n1", "Root", None).await;
        cluster.host("n1", "Mobile", Some("Root")).await;

        let n1 = cluster.node("n1");
        n1.submit_event("Mobile", "Mobile", AccessKind::Write, "apply", vec![])
            .await
            .expect("submitted");
        cluster.upcall.wait_for(1).await;

        // Let the commit watermark settle before quiescing.
        for _ in 0..100 {
            let status = n1.context_status("Mobile").await.unwrap();
            if status.execute_now_committing == status.now_serving_execute {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        n1.migrate_context(&"Mobile".to_string(), NodeAddr::new("n2"))
            .await
            .expect("migrated");

        // The source no longer hosts it; the destination does.
        assert!(n1.context_status("Mobile").await.is_err());
        let n2 = cluster.node("n2");
        for _ in 0..100 {
            if n2.context_status("Mobile").await.is_ok() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let status = n2.context_status("Mobile").await.expect("hosted on n2");
        assert!(!status.migrating);

        // Subsequent work runs on the destination.
        n2.submit_event("Mobile", "Mobile", AccessKind::Write, "apply", vec![])
            .await
            .expect("submitted");
        cluster.upcall.wait_for(2).await;
        assert_eq!(cluster.upcall.executed_in("Mobile").len(), 2);
    }

    /// A message addressed to a context mid-migration is neither dropped nor
    /// delivered early: it is held and chases the context to its new node.
    #[tokio::test(flavor = "multi_thread")]
    async fn test_in_flight_message_follows_migration() {
        let upcall = Arc::new(RecordingUpcall::with_delay(Duration::from_millis(5)));
        let cluster = TestCluster::with_upcall("Root", &["n1", "n2"], upcall);
        cluster.host("n1", "Root", None).await;
        cluster.host("n1", "Mobile", Some("Root")).await;

        let n1 = cluster.node("n1");

        // Start the migration and, concurrently, submit an event targeting
        // the migrating context from the stationary one.
        let mover = {
            let n1 = n1.clone();
            tokio::spawn(async move {
                n1.migrate_context(&"Mobile".to_string(), NodeAddr::new("n2"))
                    .await
                    .expect("migrated");
            })
        };
        n1.submit_event("Root", "Mobile", AccessKind::Write, "apply", vec![])
            .await
            .expect("submitted");
        mover.await.unwrap();

        // The event must execute exactly once, on whichever side, after the
        // move completes.
        cluster.upcall.wait_for(1).await;
        assert_eq!(cluster.upcall.executed_in("Mobile").len(), 1);

        let n2 = cluster.node("n2");
        for _ in 0..200 {
            if let Ok(status) = n2.context_status("Mobile").await {
                if status.pending_execute == 0 && status.num_writers == 0 {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("migrated context never quiesced on the destination");
    }
}
