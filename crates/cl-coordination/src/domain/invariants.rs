//! Checkable protocol properties.
//!
//! These are observational checks used by the test suite; production code
//! enforces the same properties with in-place assertions.

use crate::domain::context_lock::ContextLock;

/// At no observable instant may readers and a writer coexist, nor may there
/// be more than one writer.
pub fn invariant_reader_writer_exclusion(lock: &ContextLock) -> bool {
    !(lock.num_writers() > 0 && lock.num_readers() > 0) && lock.num_writers() <= 1
}

/// Issued tickets are strictly increasing and never reused.
pub fn invariant_ticket_monotonicity(tickets: &[u64]) -> bool {
    tickets.windows(2).all(|w| w[0] < w[1])
}

/// Admission respects ticket order: the admitted sequence never runs a later
/// ticket before an earlier one.
pub fn invariant_fifo_admission(admitted_tickets: &[u64]) -> bool {
    invariant_ticket_monotonicity(admitted_tickets)
}

/// The commit watermark never passes a gap: every ticket below it must have
/// been committed.
pub fn invariant_commit_watermark_contiguity(watermark: u64, committed: &[u64]) -> bool {
    (1..watermark).all(|t| committed.contains(&t))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::context_lock::{AccessMode, Acquire};
    use shared_types::OrderId;

    #[test]
    fn test_exclusion_holds_through_lock_transitions() {
        let mut lock = ContextLock::new("C");
        assert!(invariant_reader_writer_exclusion(&lock));

        assert!(matches!(
            lock.try_acquire(OrderId::new(1, 1), 1, AccessMode::Read, 1),
            Acquire::Granted { .. }
        ));
        assert!(invariant_reader_writer_exclusion(&lock));

        lock.release(OrderId::new(1, 1), 1);
        assert!(matches!(
            lock.try_acquire(OrderId::new(1, 2), 2, AccessMode::Write, 1),
            Acquire::Granted { .. }
        ));
        assert!(invariant_reader_writer_exclusion(&lock));
    }

    #[test]
    fn test_monotonicity() {
        assert!(invariant_ticket_monotonicity(&[1, 2, 3, 7]));
        assert!(!invariant_ticket_monotonicity(&[1, 3, 2]));
        assert!(!invariant_ticket_monotonicity(&[1, 1]));
    }

    #[test]
    fn test_watermark_contiguity() {
        assert!(invariant_commit_watermark_contiguity(1, &[]));
        assert!(invariant_commit_watermark_contiguity(3, &[1, 2]));
        assert!(!invariant_commit_watermark_contiguity(4, &[1, 3]));
    }
}
