//! Wake priority queue (part of C8): schedules endpoint retries by due time.
//! Each tick drains entries due at or before now; of two registrations for
//! the same endpoint, the earlier one fires and the later one becomes a
//! no-op.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::Instant;

#[derive(Default)]
pub struct WakeQueue {
    heap: BinaryHeap<Reverse<(Instant, u64)>>,
    earliest: HashMap<u64, Instant>,
}

impl WakeQueue {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            earliest: HashMap::new(),
        }
    }

    /// Schedules `endpoint_id` to be woken at `at`. A no-op if an earlier
    /// wake is already pending for the same endpoint.
    pub fn schedule(&mut self, endpoint_id: u64, at: Instant) {
        let should_push = match self.earliest.get(&endpoint_id) {
            Some(existing) => *existing > at,
            None => true,
        };
        if should_push {
            self.earliest.insert(endpoint_id, at);
            self.heap.push(Reverse((at, endpoint_id)));
        }
    }

    /// Pops every endpoint whose earliest scheduled wake is `<= now`, in
    /// time order, skipping stale heap entries superseded by a rescheduled
    /// earlier wake.
    pub fn drain_due(&mut self, now: Instant) -> Vec<u64> {
        let mut due = Vec::new();
        while let Some(&Reverse((at, id))) = self.heap.peek() {
            if at > now {
                break;
            }
            self.heap.pop();
            if self.earliest.get(&id) == Some(&at) {
                self.earliest.remove(&id);
                due.push(id);
            }
        }
        due
    }

    pub fn is_empty(&self) -> bool {
        self.earliest.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn drains_only_entries_due_by_now() {
        let mut q = WakeQueue::new();
        let base = Instant::now();
        q.schedule(1, base + Duration::from_millis(10));
        q.schedule(2, base + Duration::from_millis(100));
        let due = q.drain_due(base + Duration::from_millis(50));
        assert_eq!(due, vec![1]);
        assert!(!q.is_empty());
    }

    #[test]
    fn later_registration_for_same_endpoint_is_a_no_op() {
        let mut q = WakeQueue::new();
        let base = Instant::now();
        q.schedule(7, base + Duration::from_millis(5));
        q.schedule(7, base + Duration::from_millis(500));
        let due = q.drain_due(base + Duration::from_millis(10));
        assert_eq!(due, vec![7]);
        // the stale far-future heap entry must not fire again later
        let due_later = q.drain_due(base + Duration::from_secs(1));
        assert!(due_later.is_empty());
    }

    #[test]
    fn earlier_reschedule_overrides_a_pending_later_one() {
        let mut q = WakeQueue::new();
        let base = Instant::now();
        q.schedule(3, base + Duration::from_millis(200));
        q.schedule(3, base + Duration::from_millis(20));
        let due = q.drain_due(base + Duration::from_millis(30));
        assert_eq!(due, vec![3]);
    }
}
