//! Per-reference ordering for the write-behind queues.
//!
//! Every request takes a ticket from one global counter when it is enqueued.
//! For each reference the sequencer remembers the newest ticket seen per
//! operation kind and hands out an async lock that workers hold while they
//! touch the cache. A worker skips its request when the opposing operation
//! already holds a newer ticket, so a write never resurrects a record that a
//! later delete removed, and a delete never removes a record a later write
//! produced. Clocks are dropped once nothing is queued or running for the key.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Op {
    ContextWrite,
    ContextDelete,
    IndexWrite,
    IndexDelete,
}

impl Op {
    fn opposite(self) -> Op {
        match self {
            Op::ContextWrite => Op::ContextDelete,
            Op::ContextDelete => Op::ContextWrite,
            Op::IndexWrite => Op::IndexDelete,
            Op::IndexDelete => Op::IndexWrite,
        }
    }
}

#[derive(Default)]
struct KeyClock {
    lock: Arc<Mutex<()>>,
    pending: usize,
    context_write: u64,
    context_delete: u64,
    index_write: u64,
    index_delete: u64,
}

impl KeyClock {
    fn slot(&mut self, op: Op) -> &mut u64 {
        match op {
            Op::ContextWrite => &mut self.context_write,
            Op::ContextDelete => &mut self.context_delete,
            Op::IndexWrite => &mut self.index_write,
            Op::IndexDelete => &mut self.index_delete,
        }
    }

    fn observe(&mut self, op: Op, ticket: u64) {
        let slot = self.slot(op);
        *slot = (*slot).max(ticket);
    }
}

#[derive(Default)]
pub(crate) struct Sequencer {
    next: AtomicU64,
    clocks: DashMap<String, KeyClock>,
}

impl Sequencer {
    pub(crate) fn ticket(&self) -> u64 {
        self.next.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Register a queued request for `key`.
    pub(crate) fn enqueued(&self, key: &str, ops: &[Op], ticket: u64) {
        let mut clock = self.clocks.entry(key.to_string()).or_default();
        clock.pending += 1;
        for op in ops {
            clock.observe(*op, ticket);
        }
    }

    /// Record an operation whose key was only known at processing time.
    pub(crate) fn observe(&self, key: &str, ops: &[Op], ticket: u64) {
        let mut clock = self.clocks.entry(key.to_string()).or_default();
        for op in ops {
            clock.observe(*op, ticket);
        }
    }

    pub(crate) async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = self.clocks.entry(key.to_string()).or_default().lock.clone();
        lock.lock_owned().await
    }

    /// True if an opposing operation with a newer ticket exists for `key`.
    pub(crate) fn superseded(&self, key: &str, op: Op, ticket: u64) -> bool {
        self.clocks
            .get_mut(key)
            .map(|mut clock| *clock.slot(op.opposite()) > ticket)
            .unwrap_or(false)
    }

    /// Mark a request for `key` as done. `queued` is false for requests that
    /// were not registered through `enqueued`. The caller must have released
    /// the key lock.
    pub(crate) fn finished(&self, key: &str, queued: bool) {
        if queued {
            if let Some(mut clock) = self.clocks.get_mut(key) {
                clock.pending = clock.pending.saturating_sub(1);
            }
        }
        self.clocks
            .remove_if(key, |_, clock| clock.pending == 0 && Arc::strong_count(&clock.lock) == 1);
    }

    pub(crate) fn tracked_keys(&self) -> usize {
        self.clocks.len()
    }
}
