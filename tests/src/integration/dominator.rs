//! Grant ordering across a governed region, driven through real services.

#[cfg(test)]
mod tests {
    use crate::harness::{RecordingUpcall, TestCluster};
    use cl_coordination::ports::outbound::StructureView;
    use cl_coordination::CoordinationApi;
    use shared_types::AccessKind;
    use std::collections::BTreeSet;
    use std::sync::Arc;
    use std::time::Duration;

    /// Writes to sibling contexts under one dominator do not serialize
    /// against each other.
    #[tokio::test(flavor = "multi_thread")]
    async fn test_independent_siblings_run_concurrently() {
        let upcall = Arc::new(RecordingUpcall::with_delay(Duration::from_millis(40)));
        let cluster = TestCluster::with_upcall("Root", &["n1"], upcall);
        cluster.host("n1", "Root", None).await;
        cluster.host("n1", "A", Some("Root")).await;
        cluster.host("n1", "B", Some("Root")).await;

        let node = cluster.node("n1");
        node.submit_event("Root", "A", AccessKind::Write, "apply", vec![])
            .await
            .expect("submitted");
        node.submit_event("Root", "B", AccessKind::Write, "apply", vec![])
            .await
            .expect("submitted");

        cluster.upcall.wait_for(2).await;
        assert_eq!(cluster.upcall.executed_in("A").len(), 1);
        assert_eq!(cluster.upcall.executed_in("B").len(), 1);
    }

    /// A child of a locked context is granted independently of its parent's
    /// writer; the virtual-lock placeholder on the parent is cleaned up when
    /// both events are done, leaving the region reusable.
    #[tokio::test(flavor = "multi_thread")]
    async fn test_child_grant_independent_of_parent_writer() {
        let upcall = Arc::new(RecordingUpcall::with_delay(Duration::from_millis(20)));
        let cluster = TestCluster::with_upcall("Root", &["n1"], upcall);
        cluster.host("n1", "Root", None).await;
        cluster.host("n1", "A", Some("Root")).await;
        cluster.host("n1", "A.child", Some("A")).await;

        let node = cluster.node("n1");
        node.submit_event("Root", "A", AccessKind::Write, "apply", vec![])
            .await
            .expect("submitted");
        node.submit_event("Root", "A.child", AccessKind::Write, "apply", vec![])
            .await
            .expect("submitted");

        cluster.upcall.wait_for(2).await;

        // The region stayed live: a third write to the parent still works.
        node.submit_event("Root", "A", AccessKind::Write, "apply", vec![])
            .await
            .expect("submitted");
        cluster.upcall.wait_for(3).await;
        assert_eq!(cluster.upcall.executed_in("A").len(), 2);
        assert_eq!(cluster.upcall.executed_in("A.child").len(), 1);
    }

    /// Contexts hosted on different nodes still serialize through the
    /// dominator on the head node.
    #[tokio::test(flavor = "multi_thread")]
    async fn test_remote_context_asks_dominator() {
        let upcall = Arc::new(RecordingUpcall::with_delay(Duration::from_millis(10)));
        let cluster = TestCluster::with_upcall("Root", &["n1", "n2"], upcall);
        cluster.host("n1", "Root", None).await;
        cluster.host("n2", "Remote", Some("Root")).await;

        // Submitted on n2, permission resolved at the dominator on n1.
        cluster
            .node("n2")
            .submit_event("Remote", "Remote", AccessKind::Write, "apply", vec![])
            .await
            .expect("submitted");

        cluster.upcall.wait_for(1).await;
        assert_eq!(cluster.upcall.executed_in("Remote").len(), 1);

        // The second one exercises the full unlock/re-grant cycle remotely.
        cluster
            .node("n2")
            .submit_event("Remote", "Remote", AccessKind::Write, "apply", vec![])
            .await
            .expect("submitted");
        cluster.upcall.wait_for(2).await;
    }

    /// A structural edit (DLOCK) applies atomically and leaves the region
    /// working: contexts created into the new shape still execute events.
    #[tokio::test(flavor = "multi_thread")]
    async fn test_ownership_change_through_running_event() {
        let cluster = TestCluster::new("Root", &["n1"]);
        cluster.host("n1", "Root", None).await;
        cluster.host("n1", "A", Some("Root")).await;
        cluster.host("n1", "B", Some("Root")).await;

        let node = cluster.node("n1");
        let event = node
            .submit_event("Root", "Root", AccessKind::Write, "restructure", vec![])
            .await
            .expect("submitted");
        cluster.upcall.wait_for(1).await;

        // Re-parent B under A on behalf of the (now committed) event id;
        // the ops run through the dominator's structural path.
        node.record_ownership_change("Root", event, false, "Root", "B")
            .await
            .expect("recorded");
        node.record_ownership_change("Root", event, true, "A", "B")
            .await
            .expect("recorded");
        node.apply_ownership_changes("Root", event)
            .await
            .expect("applied");

        assert!(cluster.structure.is_elder_context("A", "B"));
        let b_only: BTreeSet<String> = ["B".to_string()].into_iter().collect();
        assert!(!cluster
            .structure
            .ownership_pairs_of(&b_only)
            .contains(&("Root".to_string(), "B".to_string())));

        // The reshaped region still admits work.
        node.submit_event("Root", "B", AccessKind::Write, "apply", vec![])
            .await
            .expect("submitted");
        cluster.upcall.wait_for(2).await;
        assert_eq!(cluster.upcall.executed_in("B").len(), 1);
    }
}
