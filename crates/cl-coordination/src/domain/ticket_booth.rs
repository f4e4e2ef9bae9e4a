//! Create- and commit-side ticket sequencing for one context.
//!
//! Create tickets are handed out strictly increasing and served strictly in
//! order; a waiter blocks until the serving counter reaches its ticket and is
//! woken individually, never by broadcast. Tickets marked for migration are
//! skipped by the serving counter so an in-flight migration event cannot
//! stall the context forever.
//!
//! The commit side releases events strictly in execute-ticket order. Events
//! may *finish* committing out of order; the watermark only advances across a
//! contiguous run of committed tickets.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::oneshot;
use tracing::debug;

/// Outcome of asking for one's create turn.
pub enum CreateTurn {
    /// The caller's ticket is being served now.
    Ready,
    /// Wait on the receiver; the booth wakes exactly this ticket's holder.
    Wait(oneshot::Receiver<()>),
}

/// Serializable slice of the booth, exported on migration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TicketBoothParams {
    pub next_create_ticket: u64,
    pub now_serving_create: u64,
    pub create_now_committing: u64,
    pub execute_now_committing: u64,
    pub committed_flags: BTreeMap<u64, bool>,
    pub skip_create_tickets: BTreeSet<u64>,
}

pub struct TicketBooth {
    context_name: String,
    next_create_ticket: u64,
    now_serving_create: u64,
    create_waiters: BTreeMap<u64, oneshot::Sender<()>>,
    skip_create_tickets: BTreeSet<u64>,

    create_now_committing: u64,
    execute_now_committing: u64,
    committed_flags: BTreeMap<u64, bool>,

    handling_messages: u64,
    handling_creates: u64,
    message_drain_waiter: Option<oneshot::Sender<()>>,
    create_drain_waiter: Option<oneshot::Sender<()>>,
}

impl std::fmt::Debug for TicketBooth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TicketBooth")
            .field("context_name", &self.context_name)
            .field("next_create_ticket", &self.next_create_ticket)
            .field("now_serving_create", &self.now_serving_create)
            .field("execute_now_committing", &self.execute_now_committing)
            .field("waiters", &self.create_waiters.len())
            .finish()
    }
}

impl Default for TicketBooth {
    fn default() -> Self {
        Self::new("")
    }
}

impl TicketBooth {
    pub fn new(context_name: impl Into<String>) -> Self {
        Self {
            context_name: context_name.into(),
            next_create_ticket: 1,
            now_serving_create: 1,
            create_waiters: BTreeMap::new(),
            skip_create_tickets: BTreeSet::new(),
            create_now_committing: 1,
            execute_now_committing: 1,
            committed_flags: BTreeMap::new(),
            handling_messages: 0,
            handling_creates: 0,
            message_drain_waiter: None,
            create_drain_waiter: None,
        }
    }

    pub fn set_context_name(&mut self, name: impl Into<String>) {
        self.context_name = name.into();
    }

    // ---- create pipeline ----------------------------------------------

    /// Sell the next create ticket. Strictly increasing, never reused.
    pub fn new_create_ticket(&mut self) -> u64 {
        let ticket = self.next_create_ticket;
        self.next_create_ticket += 1;
        debug!(context = %self.context_name, ticket, "sold create ticket");
        ticket
    }

    /// Ask whether `ticket`'s create turn has come.
    pub fn begin_create(&mut self, ticket: u64) -> CreateTurn {
        assert!(
            ticket >= self.now_serving_create,
            "create ticket {ticket} already served in {}",
            self.context_name
        );
        if ticket == self.now_serving_create {
            return CreateTurn::Ready;
        }
        let (tx, rx) = oneshot::channel();
        self.create_waiters.insert(ticket, tx);
        CreateTurn::Wait(rx)
    }

    /// The calling ticket holder finished its create phase; advance the
    /// serving counter past any skip-marked tickets and wake the next holder.
    pub fn finish_create(&mut self) {
        self.now_serving_create += 1;
        self.consume_skip_tickets();
        debug!(
            context = %self.context_name,
            now_serving_create = self.now_serving_create,
            "create turn advanced"
        );
        self.wake_create_waiter();
        if self.handling_creates > 0 {
            self.handling_creates -= 1;
            if self.handling_creates == 0 {
                if let Some(tx) = self.create_drain_waiter.take() {
                    let _ = tx.send(());
                }
            }
        }
    }

    /// Exempt `ticket` from create sequencing (used by migration events,
    /// which never run the create phase).
    pub fn mark_migration_ticket(&mut self, ticket: u64) {
        self.skip_create_tickets.insert(ticket);
        self.consume_skip_tickets();
        self.wake_create_waiter();
    }

    fn consume_skip_tickets(&mut self) {
        while self.skip_create_tickets.remove(&self.now_serving_create) {
            self.now_serving_create += 1;
        }
    }

    fn wake_create_waiter(&mut self) {
        if let Some(first) = self.create_waiters.keys().next().copied() {
            assert!(
                first >= self.now_serving_create,
                "create waiter for already-served ticket {first} in {}",
                self.context_name
            );
            if first == self.now_serving_create {
                if let Some(tx) = self.create_waiters.remove(&first) {
                    let _ = tx.send(());
                }
            }
        }
    }

    pub fn now_serving_create(&self) -> u64 {
        self.now_serving_create
    }

    /// Record that an admitted create event is in flight (counted for
    /// migration drain).
    pub fn create_dispatched(&mut self) {
        self.handling_creates += 1;
    }

    // ---- commit pipeline ----------------------------------------------

    pub fn execute_now_committing(&self) -> u64 {
        self.execute_now_committing
    }

    pub fn advance_create_committing(&mut self) {
        self.create_now_committing += 1;
    }

    /// Mark `ticket` committed and advance the watermark across the
    /// contiguous committed run. Returns true when the watermark moved.
    pub fn mark_committed(&mut self, ticket: u64) -> bool {
        self.committed_flags.insert(ticket, true);
        let before = self.execute_now_committing;
        while matches!(
            self.committed_flags.get(&self.execute_now_committing),
            Some(true)
        ) {
            self.committed_flags.remove(&self.execute_now_committing);
            self.execute_now_committing += 1;
        }
        if self.execute_now_committing != before {
            debug!(
                context = %self.context_name,
                execute_now_committing = self.execute_now_committing,
                "commit watermark advanced"
            );
            true
        } else {
            false
        }
    }

    // ---- migration drain ----------------------------------------------

    pub fn message_started(&mut self) {
        self.handling_messages += 1;
    }

    pub fn message_finished(&mut self) {
        assert!(
            self.handling_messages > 0,
            "message counter underflow in {}",
            self.context_name
        );
        self.handling_messages -= 1;
        if self.handling_messages == 0 {
            if let Some(tx) = self.message_drain_waiter.take() {
                let _ = tx.send(());
            }
        }
    }

    /// Wait until no in-flight messages remain. `None` means already drained.
    pub fn wait_messages_drained(&mut self) -> Option<oneshot::Receiver<()>> {
        if self.handling_messages == 0 {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        self.message_drain_waiter = Some(tx);
        Some(rx)
    }

    /// Wait until no in-flight create events remain.
    pub fn wait_creates_drained(&mut self) -> Option<oneshot::Receiver<()>> {
        if self.handling_creates == 0 {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        self.create_drain_waiter = Some(tx);
        Some(rx)
    }

    // ---- migration snapshot -------------------------------------------

    pub fn params(&self) -> TicketBoothParams {
        TicketBoothParams {
            next_create_ticket: self.next_create_ticket,
            now_serving_create: self.now_serving_create,
            create_now_committing: self.create_now_committing,
            execute_now_committing: self.execute_now_committing,
            committed_flags: self.committed_flags.clone(),
            skip_create_tickets: self.skip_create_tickets.clone(),
        }
    }

    pub fn restore(context_name: impl Into<String>, params: TicketBoothParams) -> Self {
        let mut booth = Self::new(context_name);
        booth.next_create_ticket = params.next_create_ticket;
        booth.now_serving_create = params.now_serving_create;
        booth.create_now_committing = params.create_now_committing;
        booth.execute_now_committing = params.execute_now_committing;
        booth.committed_flags = params.committed_flags;
        booth.skip_create_tickets = params.skip_create_tickets;
        booth
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_tickets_strictly_increase() {
        let mut booth = TicketBooth::new("C");
        assert_eq!(booth.new_create_ticket(), 1);
        assert_eq!(booth.new_create_ticket(), 2);
        assert_eq!(booth.new_create_ticket(), 3);
    }

    #[tokio::test]
    async fn test_create_turns_serve_in_order() {
        let mut booth = TicketBooth::new("C");
        let t1 = booth.new_create_ticket();
        let t2 = booth.new_create_ticket();

        assert!(matches!(booth.begin_create(t1), CreateTurn::Ready));
        let CreateTurn::Wait(rx) = booth.begin_create(t2) else {
            panic!("ticket 2 must wait behind ticket 1");
        };

        booth.finish_create();
        rx.await.expect("ticket 2 woken after ticket 1 finishes");
        assert!(matches!(booth.begin_create(t2), CreateTurn::Ready));
    }

    #[tokio::test]
    async fn test_migration_ticket_is_skipped() {
        let mut booth = TicketBooth::new("C");
        let t1 = booth.new_create_ticket();
        let t2 = booth.new_create_ticket();
        let t3 = booth.new_create_ticket();

        let CreateTurn::Wait(rx) = booth.begin_create(t3) else {
            panic!("ticket 3 must wait");
        };

        assert!(matches!(booth.begin_create(t1), CreateTurn::Ready));
        booth.mark_migration_ticket(t2);
        booth.finish_create();

        // t2 was skipped, so finishing t1 serves t3 directly.
        rx.await.expect("ticket 3 woken across the skipped ticket");
        assert_eq!(booth.now_serving_create(), t3);
    }

    #[test]
    fn test_commit_watermark_requires_contiguous_run() {
        let mut booth = TicketBooth::new("C");
        assert_eq!(booth.execute_now_committing(), 1);

        // ticket 3 commits before 1 and 2: no movement
        assert!(!booth.mark_committed(3));
        assert_eq!(booth.execute_now_committing(), 1);

        assert!(booth.mark_committed(1));
        assert_eq!(booth.execute_now_committing(), 2);

        // 2 closes the gap; watermark runs through 3
        assert!(booth.mark_committed(2));
        assert_eq!(booth.execute_now_committing(), 4);
    }

    #[tokio::test]
    async fn test_message_drain_wakes_at_zero() {
        let mut booth = TicketBooth::new("C");
        assert!(booth.wait_messages_drained().is_none());

        booth.message_started();
        booth.message_started();
        let rx = booth.wait_messages_drained().expect("two in flight");

        booth.message_finished();
        booth.message_finished();
        rx.await.expect("woken when counter hits zero");
    }

    #[test]
    fn test_params_roundtrip() {
        let mut booth = TicketBooth::new("C");
        booth.new_create_ticket();
        booth.new_create_ticket();
        booth.mark_committed(2);

        let restored = TicketBooth::restore("C", booth.params());
        assert_eq!(restored.next_create_ticket, 3);
        assert_eq!(restored.execute_now_committing(), 1);
        assert!(restored.committed_flags.contains_key(&2));
    }
}
