use std::collections::VecDeque;

use tracing::warn;

use crate::extension::Operation;

/// An operation waiting for a live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deferred {
    pub op: Operation,
    /// Only the first collapsible entry per reason runs when the queue drains.
    pub collapsible: bool,
}

/// Per-session FIFO of operations awaiting a connection.
///
/// Bounded: past `capacity` the oldest entry is dropped. A capacity of zero
/// means unbounded.
#[derive(Debug)]
pub struct DeferredQueue {
    capacity: usize,
    entries: VecDeque<Deferred>,
    dropped: u64,
}

impl DeferredQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: VecDeque::new(),
            dropped: 0,
        }
    }

    /// Appends, returning the entry evicted to make room, if any.
    pub fn push(&mut self, entry: Deferred) -> Option<Deferred> {
        self.entries.push_back(entry);
        self.trim()
    }

    /// Puts an entry back at the head, e.g. after it failed mid-drain.
    pub fn push_front(&mut self, entry: Deferred) -> Option<Deferred> {
        self.entries.push_front(entry);
        self.trim()
    }

    fn trim(&mut self) -> Option<Deferred> {
        if self.capacity == 0 || self.entries.len() <= self.capacity {
            return None;
        }
        let evicted = self.entries.pop_front();
        if let Some(entry) = &evicted {
            self.dropped += 1;
            warn!(op = %entry.op, dropped = self.dropped, "Deferred queue full, dropping oldest operation");
        }
        evicted
    }

    pub fn pop_front(&mut self) -> Option<Deferred> {
        self.entries.pop_front()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Total entries evicted since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn ops(&self) -> impl Iterator<Item = &Operation> {
        self.entries.iter().map(|e| &e.op)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extension::Reason;

    fn op(reason: Reason) -> Deferred {
        Deferred {
            op: Operation::refresh(reason),
            collapsible: false,
        }
    }

    #[test]
    fn keeps_fifo_order() {
        let mut queue = DeferredQueue::new(8);
        queue.push(op(Reason::Periodic));
        queue.push(op(Reason::Manual));
        queue.push(op(Reason::ScreenOn));

        let order: Vec<_> = std::iter::from_fn(|| queue.pop_front())
            .map(|d| d.op.reason().unwrap())
            .collect();
        assert_eq!(order, vec![Reason::Periodic, Reason::Manual, Reason::ScreenOn]);
    }

    #[test]
    fn drops_oldest_past_capacity() {
        let mut queue = DeferredQueue::new(2);
        assert!(queue.push(op(Reason::Periodic)).is_none());
        assert!(queue.push(op(Reason::Manual)).is_none());
        let evicted = queue.push(op(Reason::ScreenOn)).unwrap();

        assert_eq!(evicted.op, Operation::refresh(Reason::Periodic));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.dropped(), 1);
        assert_eq!(
            queue.ops().copied().collect::<Vec<_>>(),
            vec![
                Operation::refresh(Reason::Manual),
                Operation::refresh(Reason::ScreenOn)
            ]
        );
    }

    #[test]
    fn zero_capacity_is_unbounded() {
        let mut queue = DeferredQueue::new(0);
        for _ in 0..1000 {
            assert!(queue.push(op(Reason::Periodic)).is_none());
        }
        assert_eq!(queue.len(), 1000);
    }

    #[test]
    fn push_front_restores_head() {
        let mut queue = DeferredQueue::new(4);
        queue.push(op(Reason::Manual));
        queue.push_front(op(Reason::Initial));
        assert_eq!(
            queue.pop_front().unwrap().op,
            Operation::refresh(Reason::Initial)
        );
    }
}
