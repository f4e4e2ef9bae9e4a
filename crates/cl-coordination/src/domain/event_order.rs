//! Per-context mapping between an event's global identity and its execute
//! ticket.
//!
//! The map is a bijection: each [`OrderId`] maps to exactly one ticket at a
//! time, and every issued ticket is strictly below the next-ticket counter.

use serde::{Deserialize, Serialize};
use shared_types::OrderId;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutionOrder {
    context_name: String,
    by_ticket: BTreeMap<u64, OrderId>,
    by_event: HashMap<OrderId, u64>,
    next_ticket: u64,
}

impl Default for ExecutionOrder {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionOrder {
    pub fn new() -> Self {
        Self {
            context_name: String::new(),
            by_ticket: BTreeMap::new(),
            by_event: HashMap::new(),
            next_ticket: 1,
        }
    }

    pub fn set_context_name(&mut self, name: impl Into<String>) {
        self.context_name = name.into();
    }

    /// Assign the next execute ticket to `event`. Assigning twice to the same
    /// event is a sequencing bug.
    pub fn assign(&mut self, event: OrderId) -> u64 {
        assert!(
            !self.by_event.contains_key(&event),
            "event {event} already holds an execute ticket in {}",
            self.context_name
        );
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        self.by_ticket.insert(ticket, event);
        self.by_event.insert(event, ticket);
        debug!(context = %self.context_name, %event, ticket, "execute ticket assigned");
        ticket
    }

    /// The ticket held by `event`, or `None`. An issued ticket at or above
    /// the counter is a corruption of the map and fatal.
    pub fn ticket_of(&self, event: &OrderId) -> Option<u64> {
        let ticket = self.by_event.get(event).copied()?;
        assert!(
            ticket < self.next_ticket,
            "ticket {ticket} of event {event} >= counter {} in {}",
            self.next_ticket,
            self.context_name
        );
        Some(ticket)
    }

    pub fn event_at(&self, ticket: u64) -> Option<OrderId> {
        self.by_ticket.get(&ticket).copied()
    }

    /// Forget the event's ticket after commit. Unknown events are ignored.
    pub fn remove(&mut self, event: &OrderId) {
        if let Some(ticket) = self.by_event.remove(event) {
            self.by_ticket.remove(&ticket);
        }
    }

    /// The next ticket that would be issued.
    pub fn next_ticket(&self) -> u64 {
        self.next_ticket
    }

    pub fn clear(&mut self) {
        self.by_ticket.clear();
        self.by_event.clear();
        self.next_ticket = 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tickets_strictly_increase_and_never_reuse() {
        let mut order = ExecutionOrder::new();
        let e1 = OrderId::new(1, 1);
        let e2 = OrderId::new(1, 2);

        assert_eq!(order.assign(e1), 1);
        assert_eq!(order.assign(e2), 2);

        order.remove(&e1);
        let e3 = OrderId::new(1, 3);
        // ticket 1 is gone forever
        assert_eq!(order.assign(e3), 3);
    }

    #[test]
    fn test_bijection() {
        let mut order = ExecutionOrder::new();
        let e = OrderId::new(4, 9);
        let t = order.assign(e);
        assert_eq!(order.ticket_of(&e), Some(t));
        assert_eq!(order.event_at(t), Some(e));

        order.remove(&e);
        assert_eq!(order.ticket_of(&e), None);
        assert_eq!(order.event_at(t), None);
    }

    #[test]
    #[should_panic]
    fn test_double_assignment_is_fatal() {
        let mut order = ExecutionOrder::new();
        let e = OrderId::new(1, 1);
        order.assign(e);
        order.assign(e);
    }

    #[test]
    fn test_unknown_event_has_no_ticket() {
        let order = ExecutionOrder::new();
        assert_eq!(order.ticket_of(&OrderId::new(9, 9)), None);
    }
}
