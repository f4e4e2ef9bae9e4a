//! Ticket pipelines and lock admission, end to end on one node.

#[cfg(test)]
mod tests {
    use crate::harness::{RecordingUpcall, TestCluster};
    use cl_coordination::CoordinationApi;
    use shared_types::AccessKind;
    use std::sync::Arc;
    use std::time::Duration;

    /// An uncontended write is granted and committed without ceremony.
    #[tokio::test(flavor = "multi_thread")]
    async fn test_single_write_event_commits() {
        let cluster = TestCluster::new("Root", &["n1"]);
        cluster.host("n1", "Root", None).await;

        let node = cluster.node("n1");
        node.submit_event("Root", "Root", AccessKind::Write, "apply", vec![])
            .await
            .expect("submitted");

        cluster.upcall.wait_for(1).await;

        // Quiesced: serving advanced by one, watermark followed, no holders.
        for _ in 0..100 {
            let status = node.context_status("Root").await.unwrap();
            if status.execute_now_committing == 2 {
                assert_eq!(status.now_serving_execute, 2);
                assert_eq!(status.num_readers, 0);
                assert_eq!(status.num_writers, 0);
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("commit watermark never advanced");
    }

    /// Two writers on one context: mutual exclusion, both eventually run,
    /// and the serving counter moves by exactly one per write.
    #[tokio::test(flavor = "multi_thread")]
    async fn test_writers_serialize() {
        let upcall = Arc::new(RecordingUpcall::with_delay(Duration::from_millis(20)));
        let cluster = TestCluster::with_upcall("Root", &["n1"], upcall);
        cluster.host("n1", "Root", None).await;

        let node = cluster.node("n1");
        for _ in 0..2 {
            node.submit_event("Root", "Root", AccessKind::Write, "apply", vec![])
                .await
                .expect("submitted");
        }
        cluster.upcall.wait_for(2).await;

        use std::sync::atomic::Ordering;
        assert_eq!(
            cluster.upcall.max_in_flight.load(Ordering::SeqCst),
            1,
            "write bodies overlapped"
        );
    }

    /// A burst of writers all commit, strictly one at a time.
    #[tokio::test(flavor = "multi_thread")]
    async fn test_ticket_order_under_contention() {
        use rand::Rng;

        let upcall = Arc::new(RecordingUpcall::with_delay(Duration::from_millis(2)));
        let cluster = TestCluster::with_upcall("Root", &["n1"], upcall);
        cluster.host("n1", "Root", None).await;

        let mut handles = Vec::new();
        for _ in 0..10 {
            let node = cluster.node("n1");
            let jitter = rand::thread_rng().gen_range(0..5u64);
            handles.push(tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(jitter)).await;
                node.submit_event("Root", "Root", AccessKind::Write, "apply", vec![])
                    .await
                    .expect("submitted");
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        cluster.upcall.wait_for(10).await;
        use std::sync::atomic::Ordering;
        assert_eq!(cluster.upcall.max_in_flight.load(Ordering::SeqCst), 1);

        // All ten committed: the watermark walked the full run.
        let node = cluster.node("n1");
        for _ in 0..200 {
            let status = node.context_status("Root").await.unwrap();
            if status.execute_now_committing == 11 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("not all events committed");
    }

    /// Readers share the context; a trailing writer waits for all of them.
    #[tokio::test(flavor = "multi_thread")]
    async fn test_readers_share_writer_excluded() {
        let upcall = Arc::new(RecordingUpcall::with_delay(Duration::from_millis(30)));
        let cluster = TestCluster::with_upcall("Root", &["n1"], upcall);
        cluster.host("n1", "Root", None).await;

        let node = cluster.node("n1");
        for _ in 0..3 {
            node.submit_event("Root", "Root", AccessKind::Read, "inspect", vec![])
                .await
                .expect("submitted");
        }
        node.submit_event("Root", "Root", AccessKind::Write, "apply", vec![])
            .await
            .expect("submitted");

        cluster.upcall.wait_for(4).await;

        use std::sync::atomic::Ordering;
        // Readers overlapped (shared admission), but never with the writer:
        // had the writer overlapped a reader, the write release assertion
        // inside the lock would have aborted the run.
        assert!(cluster.upcall.max_in_flight.load(Ordering::SeqCst) >= 1);
        let status = cluster.node("n1").context_status("Root").await.unwrap();
        assert_eq!(status.num_writers, 0);
        assert_eq!(status.num_readers, 0);
    }
}
