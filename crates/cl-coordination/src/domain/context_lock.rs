//! The reader/writer/migration state machine gating execution inside one
//! context.
//!
//! Admission is ticket-ordered: an event may only pass once the serving
//! counter reaches its execute ticket *and* its requested mode is compatible
//! with the current holders. Waiters are keyed by ticket and woken one at a
//! time: releasing ticket *n* wakes exactly the waiter for the now-serving
//! ticket, never a broadcast. A waiter left behind for an already-served
//! ticket is a fatal protocol violation.

use serde::{Deserialize, Serialize};
use shared_types::OrderId;
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::oneshot;
use tracing::debug;

/// Requested access mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessMode {
    Read,
    Write,
    /// Exclusive access for exporting the context; additionally requires the
    /// commit watermark to have reached the event's ticket.
    Migration,
}

/// Outcome of an acquisition attempt.
pub enum Acquire {
    /// Lock granted. `advanced` is true when the serving counter moved and
    /// execute admission must re-run.
    Granted { advanced: bool },
    /// The event already holds this context; acquisition is a no-op.
    Reentrant,
    /// Not yet: wait on the receiver, then retry.
    Wait(oneshot::Receiver<()>),
}

/// Serializable slice of the lock, exported on migration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ContextLockParams {
    pub now_serving_execute: u64,
    pub last_write: u64,
    pub reader_events: BTreeSet<OrderId>,
    pub writer_events: BTreeSet<OrderId>,
}

pub struct ContextLock {
    context_name: String,
    num_readers: u32,
    num_writers: u32,
    reader_events: BTreeSet<OrderId>,
    writer_events: BTreeSet<OrderId>,
    waiters: BTreeMap<u64, oneshot::Sender<()>>,
    now_serving_execute: u64,
    last_write: u64,
}

impl std::fmt::Debug for ContextLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextLock")
            .field("context_name", &self.context_name)
            .field("num_readers", &self.num_readers)
            .field("num_writers", &self.num_writers)
            .field("now_serving_execute", &self.now_serving_execute)
            .field("waiters", &self.waiters.len())
            .finish()
    }
}

impl Default for ContextLock {
    fn default() -> Self {
        Self::new("")
    }
}

impl ContextLock {
    pub fn new(context_name: impl Into<String>) -> Self {
        Self {
            context_name: context_name.into(),
            num_readers: 0,
            num_writers: 0,
            reader_events: BTreeSet::new(),
            writer_events: BTreeSet::new(),
            waiters: BTreeMap::new(),
            now_serving_execute: 1,
            last_write: 0,
        }
    }

    pub fn set_context_name(&mut self, name: impl Into<String>) {
        self.context_name = name.into();
    }

    pub fn now_serving_execute(&self) -> u64 {
        self.now_serving_execute
    }

    pub fn num_readers(&self) -> u32 {
        self.num_readers
    }

    pub fn num_writers(&self) -> u32 {
        self.num_writers
    }

    pub fn holds(&self, event: &OrderId) -> bool {
        self.reader_events.contains(event) || self.writer_events.contains(event)
    }

    pub fn held_mode(&self, event: &OrderId) -> Option<AccessMode> {
        if self.reader_events.contains(event) {
            Some(AccessMode::Read)
        } else if self.writer_events.contains(event) {
            Some(AccessMode::Write)
        } else {
            None
        }
    }

    fn blocked(&self, ticket: u64, mode: AccessMode, now_committing: u64) -> bool {
        ticket > self.now_serving_execute
            || match mode {
                AccessMode::Read => self.num_writers != 0,
                AccessMode::Write => self.num_readers != 0 || self.num_writers != 0,
                AccessMode::Migration => {
                    self.num_readers != 0
                        || self.num_writers != 0
                        || now_committing != ticket
                }
            }
    }

    /// Try to take the lock for `event` at `ticket`. Callers loop: on
    /// [`Acquire::Wait`], await the receiver and try again.
    pub fn try_acquire(
        &mut self,
        event: OrderId,
        ticket: u64,
        mode: AccessMode,
        now_committing: u64,
    ) -> Acquire {
        assert!(ticket > 0, "event {event} has no execute ticket");

        if self.holds(&event) {
            debug!(context = %self.context_name, %event, "re-entrant acquisition");
            return Acquire::Reentrant;
        }

        if self.blocked(ticket, mode, now_committing) {
            let (tx, rx) = oneshot::channel();
            self.waiters.insert(ticket, tx);
            return Acquire::Wait(rx);
        }
        // Our retry may have left a stale waiter entry at our own ticket.
        self.waiters.remove(&ticket);

        assert!(ticket <= self.now_serving_execute);

        let mut advanced = false;
        match mode {
            AccessMode::Read => {
                assert_eq!(self.num_writers, 0);
                self.num_readers += 1;
                self.reader_events.insert(event);
                if ticket == self.now_serving_execute {
                    self.now_serving_execute += 1;
                    advanced = true;
                }
                self.wake_next();
            }
            AccessMode::Write => {
                assert_eq!(self.num_readers, 0);
                assert_eq!(self.num_writers, 0);
                self.num_writers = 1;
                self.last_write = ticket;
                self.writer_events.insert(event);
            }
            AccessMode::Migration => {
                assert_eq!(self.num_readers, 0);
                assert_eq!(self.num_writers, 0);
                assert_eq!(now_committing, ticket);
                self.num_writers = 1;
                self.last_write = ticket;
                self.writer_events.insert(event);
            }
        }
        debug!(
            context = %self.context_name,
            %event,
            ticket,
            ?mode,
            num_readers = self.num_readers,
            num_writers = self.num_writers,
            "lock granted"
        );
        Acquire::Granted { advanced }
    }

    /// Release whatever `event` holds. Returns true when the serving counter
    /// advanced (write release) and execute admission must re-run.
    pub fn release(&mut self, event: OrderId, ticket: u64) -> bool {
        let mode = self
            .held_mode(&event)
            .unwrap_or_else(|| panic!("event {event} holds no lock on {}", self.context_name));
        match mode {
            AccessMode::Read => {
                assert!(self.num_readers > 0);
                self.num_readers -= 1;
                self.reader_events.remove(&event);
                self.wake_next();
                false
            }
            AccessMode::Write | AccessMode::Migration => {
                assert!(self.num_readers == 0 && self.num_writers == 1);
                self.num_writers = 0;
                assert_eq!(
                    ticket, self.now_serving_execute,
                    "write release out of ticket order in {}",
                    self.context_name
                );
                self.now_serving_execute += 1;
                self.writer_events.remove(&event);
                debug!(
                    context = %self.context_name,
                    %event,
                    now_serving_execute = self.now_serving_execute,
                    "write released"
                );
                self.wake_next();
                true
            }
        }
    }

    /// Wake the waiter blocked at the current serving ticket, if any. Used
    /// when the commit watermark moves while a migration event waits.
    pub fn notify_migration_waiter(&mut self) {
        if let Some(first) = self.waiters.keys().next().copied() {
            if first == self.now_serving_execute {
                if let Some(tx) = self.waiters.remove(&first) {
                    let _ = tx.send(());
                }
            }
        }
    }

    fn wake_next(&mut self) {
        if let Some(first) = self.waiters.keys().next().copied() {
            assert!(
                first >= self.now_serving_execute,
                "waiter for already-served ticket {first} in {}",
                self.context_name
            );
            if first == self.now_serving_execute {
                if let Some(tx) = self.waiters.remove(&first) {
                    let _ = tx.send(());
                }
            }
        }
    }

    // ---- migration snapshot -------------------------------------------

    pub fn params(&self) -> ContextLockParams {
        ContextLockParams {
            now_serving_execute: self.now_serving_execute,
            last_write: self.last_write,
            reader_events: self.reader_events.clone(),
            writer_events: self.writer_events.clone(),
        }
    }

    pub fn restore(context_name: impl Into<String>, params: ContextLockParams) -> Self {
        let mut lock = Self::new(context_name);
        lock.now_serving_execute = params.now_serving_execute;
        lock.last_write = params.last_write;
        lock.num_readers = params.reader_events.len() as u32;
        lock.num_writers = params.writer_events.len() as u32;
        lock.reader_events = params.reader_events;
        lock.writer_events = params.writer_events;
        lock
    }
}
