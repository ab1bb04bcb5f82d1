use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use crate::class::Handle;

/// Scheduling sequence number, breaking ties between equal fire times.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct TimerToken(u64);

/// Fire-once respawn timers, at most one per definition.
///
/// Timers are ordered by fire time, then by scheduling order.
#[derive(Debug, Default)]
pub struct RespawnScheduler {
    queue: BTreeMap<(Duration, TimerToken), Handle>,
    pending: HashMap<Handle, (Duration, TimerToken)>,
    next_token: u64,
}

impl RespawnScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `handle` to respawn at `fire_at`, replacing any pending timer for it.
    pub fn schedule(&mut self, handle: Handle, fire_at: Duration) {
        self.cancel(handle);
        let token = TimerToken(self.next_token);
        self.next_token += 1;
        self.queue.insert((fire_at, token), handle);
        self.pending.insert(handle, (fire_at, token));
    }

    /// Cancel the pending timer for `handle`. Returns whether one existed.
    pub fn cancel(&mut self, handle: Handle) -> bool {
        match self.pending.remove(&handle) {
            Some(key) => {
                self.queue.remove(&key);
                true
            }
            None => false,
        }
    }

    pub fn is_pending(&self, handle: Handle) -> bool {
        self.pending.contains_key(&handle)
    }

    /// When the pending timer for `handle` fires.
    pub fn fire_time(&self, handle: Handle) -> Option<Duration> {
        self.pending.get(&handle).map(|(at, _)| *at)
    }

    /// Remove and return every timer due at or before `now`, earliest first.
    pub fn pop_due(&mut self, now: Duration) -> Vec<Handle> {
        let mut due = Vec::new();
        while let Some(entry) = self.queue.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let handle = entry.remove();
            self.pending.remove(&handle);
            due.push(handle);
        }
        due
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
        self.pending.clear();
    }
}
