//! Deadline-ordered queue of deferred probes.
//!
//! Entries are keyed by `(deadline, sequence)`; the sequence number breaks
//! ties in insertion order so two entries with the same deadline pop
//! deterministically. Owners keep the returned [`WaitKey`] so they can
//! cancel their entry on teardown.

use std::collections::BTreeMap;

use tokio::time::Instant;

use crate::target::set::SetId;
use crate::target::TargetId;

/// What to probe when an entry expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WaitPayload {
    Target(TargetId),
    Set(SetId),
}

/// Handle to a scheduled entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WaitKey {
    deadline: Instant,
    seq: u64,
}

impl WaitKey {
    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}

#[derive(Debug, Default)]
pub struct WaitQueue {
    entries: BTreeMap<WaitKey, WaitPayload>,
    next_seq: u64,
}

impl WaitQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, deadline: Instant, payload: WaitPayload) -> WaitKey {
        let key = WaitKey {
            deadline,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        self.entries.insert(key, payload);
        key
    }

    /// Remove and return the earliest entry whose deadline has passed.
    pub fn pop_ready(&mut self, now: Instant) -> Option<WaitPayload> {
        match self.entries.first_key_value() {
            Some((key, _)) if key.deadline <= now => {
                self.entries.pop_first().map(|(_, payload)| payload)
            }
            _ => None,
        }
    }

    /// Remove an entry ahead of its deadline. Returns its payload if it was
    /// still queued.
    pub fn cancel(&mut self, key: WaitKey) -> Option<WaitPayload> {
        self.entries.remove(&key)
    }

    /// Deadline of the earliest entry.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.first_key_value().map(|(key, _)| key.deadline)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
