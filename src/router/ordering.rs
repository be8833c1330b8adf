//! Delivery order
//!
//! Admin messages first, then oldest first, then by id.
//!
//! FIFO holds to the resolution of `created_at`. Messages stamped in the same
//! instant (coarse clocks, several writers on one store) fall back to id
//! order, which is stable but not submission order.

use crate::message::Message;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// Compare two messages in delivery order (`Less` is delivered first).
pub fn delivery_order(a: &Message, b: &Message) -> Ordering {
    b.source_tag
        .cmp(&a.source_tag)
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| a.id.cmp(&b.id))
}

/// Heap entry; BinaryHeap is a max-heap, so the first message to deliver
/// must compare as Greater.
struct Queued(Message);

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Queued {}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> Ordering {
        delivery_order(&self.0, &other.0).reverse()
    }
}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Undelivered messages for one channel as of one store read.
///
/// Yields in delivery order, sorting lazily as it goes. It is finite and
/// cannot be restarted; take a new snapshot to see later arrivals.
pub struct PendingSnapshot {
    heap: BinaryHeap<Queued>,
}

impl PendingSnapshot {
    pub fn new(messages: impl IntoIterator<Item = Message>) -> Self {
        Self {
            heap: messages.into_iter().map(Queued).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

impl Iterator for PendingSnapshot {
    type Item = Message;

    fn next(&mut self) -> Option<Message> {
        self.heap.pop().map(|queued| queued.0)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.heap.len(), Some(self.heap.len()))
    }
}

impl ExactSizeIterator for PendingSnapshot {}
