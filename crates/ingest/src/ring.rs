//! Bounded FIFO of ingested events.
//!
//! Pushing at capacity evicts the oldest element.  Event ids are assigned by
//! the owning [`IngestorCore`](crate::base::IngestorCore), not here, so they
//! keep increasing across evictions and [`clear`](EventRing::clear).

use std::collections::VecDeque;

use dl_domain::event::IngestedEvent;

pub struct EventRing {
    capacity: usize,
    items: VecDeque<IngestedEvent>,
}

impl EventRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            items: VecDeque::with_capacity(capacity.max(1)),
        }
    }

    pub fn push(&mut self, event: IngestedEvent) {
        if self.items.len() == self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(event);
    }

    /// All buffered events, oldest first.
    pub fn to_vec(&self) -> Vec<IngestedEvent> {
        self.items.iter().cloned().collect()
    }

    /// Events with `id > after_id`, in id order.  O(n) over the buffer,
    /// which is bounded at 1000 elements.
    pub fn since(&self, after_id: i64) -> Vec<IngestedEvent> {
        self.items
            .iter()
            .filter(|e| e.id > after_id)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drop all buffered events.  Id counters live with the owner and are
    /// unaffected.
    pub fn clear(&mut self) {
        self.items.clear();
    }
}
