//! Monotonic clock and the scheduler's timer heap.
//!
//! One entry per coroutine with an active timeout. Re-suspending a coroutine
//! replaces its recorded deadline; a popped entry whose deadline no longer
//! matches the coroutine's current deadline is a stale tombstone and is
//! silently discarded (see design notes on stale heap entries).

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

use crate::coroutine::CoroId;
use crate::message::Value;

/// Slack applied when deciding whether a timer has fired. Mirrors real
/// schedulers that don't want to spin on a deadline that is technically
/// still a few microseconds in the future.
pub const EXPIRY_SLACK: Duration = Duration::from_millis(1);

/// A single (deadline, coroutine, alarm-value) timer entry.
#[derive(Debug, Clone)]
pub struct TimerEntry {
    pub deadline: Instant,
    pub coro: CoroId,
    pub alarm: Value,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline
    }
}
impl Eq for TimerEntry {}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so that `BinaryHeap` (a max-heap) pops the *earliest*
        // deadline first.
        other.deadline.cmp(&self.deadline)
    }
}
impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Min-heap of pending timers, keyed by deadline.
#[derive(Default)]
pub struct TimerHeap {
    heap: BinaryHeap<TimerEntry>,
}

impl TimerHeap {
    pub fn new() -> Self {
        TimerHeap {
            heap: BinaryHeap::new(),
        }
    }

    /// Schedule (or reschedule) a timer for `coro`.
    pub fn push(&mut self, coro: CoroId, deadline: Instant, alarm: Value) {
        self.heap.push(TimerEntry {
            deadline,
            coro,
            alarm,
        });
    }

    /// Deadline of the earliest pending timer, if any.
    pub fn earliest(&self) -> Option<Instant> {
        self.heap.peek().map(|e| e.deadline)
    }

    /// Pop every entry whose deadline has passed (within `EXPIRY_SLACK`),
    /// calling `is_current` to validate against tombstoning before handing
    /// the entry to the caller. Entries that fail validation are dropped
    /// silently; callers only ever see live, current timers.
    pub fn drain_expired<F>(&mut self, now: Instant, mut is_current: F) -> Vec<TimerEntry>
    where
        F: FnMut(&TimerEntry) -> bool,
    {
        let mut fired = Vec::new();
        while let Some(top) = self.heap.peek() {
            if top.deadline > now + EXPIRY_SLACK {
                break;
            }
            let entry = self.heap.pop().expect("peeked entry must pop");
            if is_current(&entry) {
                fired.push(entry);
            }
        }
        fired
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

/// Compute the bound the scheduler should pass to the notifier's `poll`:
/// the time remaining until the earliest timer, or `None` (block forever)
/// if there are no pending timers.
pub fn sleep_bound(heap: &TimerHeap, now: Instant) -> Option<Duration> {
    heap.earliest().map(|deadline| {
        if deadline <= now {
            Duration::from_secs(0)
        } else {
            deadline - now
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coroutine::CoroId;

    #[test]
    fn pops_earliest_first() {
        let mut heap = TimerHeap::new();
        let now = Instant::now();
        heap.push(CoroId(1), now + Duration::from_millis(300), Value::None);
        heap.push(CoroId(2), now + Duration::from_millis(100), Value::None);
        heap.push(CoroId(3), now + Duration::from_millis(200), Value::None);

        assert_eq!(heap.earliest(), Some(now + Duration::from_millis(100)));
        let fired = heap.drain_expired(now + Duration::from_millis(250), |_| true);
        let ids: Vec<_> = fired.iter().map(|e| e.coro).collect();
        assert_eq!(ids, vec![CoroId(2), CoroId(3)]);
    }

    #[test]
    fn stale_entries_are_discarded() {
        let mut heap = TimerHeap::new();
        let now = Instant::now();
        heap.push(CoroId(1), now, Value::None);
        // Re-suspend with a later deadline; the old entry becomes stale.
        heap.push(CoroId(1), now + Duration::from_millis(50), Value::None);

        let fired = heap.drain_expired(now, |entry| entry.deadline == now + Duration::from_millis(50));
        assert!(fired.is_empty(), "stale entry at `now` must be rejected");
    }
}
