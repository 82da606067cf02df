//! Single-shot expiry timers for allocations, permissions, channels and
//! reservation tokens.
//!
//! Modeled as one min-heap keyed by deadline (§9): canceling or
//! resetting a timer never touches the heap directly, it only bumps a
//! generation counter on the entry. A popped heap entry whose generation
//! no longer matches the live entry is stale and is discarded — this is
//! what makes a reset atomic with respect to its own expiry callback,
//! with no need for a lock.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

struct Entry<T> {
    generation: u64,
    deadline: u64,
    payload: T,
}

/// `T` is whatever the owner needs back when a timer fires — typically
/// an allocation/permission/channel/token key.
#[derive(Default)]
pub struct TimerWheel<T> {
    next_id: u64,
    entries: HashMap<TimerId, Entry<T>>,
    heap: BinaryHeap<Reverse<(u64, u64, TimerId)>>,
}

impl<T> TimerWheel<T> {
    pub fn new() -> Self {
        Self {
            next_id: 0,
            entries: HashMap::new(),
            heap: BinaryHeap::new(),
        }
    }

    /// Arm a new single-shot timer for `deadline` (in the caller's
    /// monotonic seconds-since-epoch clock).
    pub fn arm(&mut self, deadline: u64, payload: T) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;

        self.entries.insert(
            id,
            Entry {
                generation: 0,
                deadline,
                payload,
            },
        );
        self.heap.push(Reverse((deadline, 0, id)));

        id
    }

    /// Reset an armed timer to a new deadline. No-op (returns `false`)
    /// if the timer was already canceled or has already fired.
    pub fn reset(&mut self, id: TimerId, deadline: u64) -> bool {
        match self.entries.get_mut(&id) {
            Some(entry) => {
                entry.generation += 1;
                entry.deadline = deadline;
                self.heap.push(Reverse((deadline, entry.generation, id)));
                true
            }
            None => false,
        }
    }

    /// Cancel a timer, returning its payload if it was still armed.
    pub fn cancel(&mut self, id: TimerId) -> Option<T> {
        self.entries.remove(&id).map(|e| e.payload)
    }

    /// Drain every timer whose deadline has passed `now`, returning its
    /// id and payload. Each drained timer is consumed (single-shot).
    pub fn poll(&mut self, now: u64) -> Vec<(TimerId, T)> {
        let mut fired = Vec::new();

        while let Some(&Reverse((deadline, generation, id))) = self.heap.peek() {
            if deadline > now {
                break;
            }

            self.heap.pop();

            let is_current = self
                .entries
                .get(&id)
                .map(|e| e.generation == generation)
                .unwrap_or(false);

            if is_current {
                if let Some(entry) = self.entries.remove(&id) {
                    fired.push((id, entry.payload));
                }
            }
        }

        fired
    }

    /// The next deadline with a live timer, if any — used by the event
    /// loop to size its next `select!` sleep.
    pub fn next_deadline(&self) -> Option<u64> {
        self.heap.iter().filter_map(|Reverse((deadline, generation, id))| {
            self.entries
                .get(id)
                .filter(|e| e.generation == *generation)
                .map(|_| *deadline)
        }).min()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_once_past_deadline() {
        let mut timers = TimerWheel::new();
        let id = timers.arm(100, "allocation-a");

        assert!(timers.poll(50).is_empty());
        let fired = timers.poll(100);
        assert_eq!(fired, vec![(id, "allocation-a")]);

        // single-shot: a second poll at the same or later time fires nothing.
        assert!(timers.poll(200).is_empty());
    }

    #[test]
    fn reset_observes_only_the_new_deadline() {
        let mut timers = TimerWheel::new();
        let id = timers.arm(100, "allocation-a");
        assert!(timers.reset(id, 200));

        // the old deadline's heap entry is now stale and must not fire.
        assert!(timers.poll(150).is_empty());
        assert_eq!(timers.poll(200), vec![(id, "allocation-a")]);
    }

    #[test]
    fn cancel_prevents_future_firing() {
        let mut timers = TimerWheel::new();
        let id = timers.arm(100, "allocation-a");
        assert_eq!(timers.cancel(id), Some("allocation-a"));
        assert!(timers.poll(1000).is_empty());
    }

    #[test]
    fn next_deadline_ignores_stale_entries() {
        let mut timers = TimerWheel::new();
        let id = timers.arm(100, "a");
        timers.reset(id, 500);
        assert_eq!(timers.next_deadline(), Some(500));
    }
}
