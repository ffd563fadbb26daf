//! Ordering of delayed messages
//!
//! `BinaryHeap` is a max-heap, so the ordering below is reversed: the entry
//! with the earliest trigger time, and among equal triggers the lowest
//! sequence number, compares greatest and is popped first.

use std::cmp::Ordering;
use std::time::{Duration, Instant};

use crate::message::Message;

/// A message waiting in the delayed heap
#[derive(Debug)]
pub(crate) struct DelayedMessage {
    /// Delay requested by the poster
    pub delay: Duration,
    /// Absolute time at which the message becomes ready
    pub trigger: Instant,
    /// Per-queue submission counter, breaks ties between equal triggers
    pub seq: u64,
    pub msg: Message,
}

impl DelayedMessage {
    pub fn new(delay: Duration, trigger: Instant, seq: u64, msg: Message) -> Self {
        Self {
            delay,
            trigger,
            seq,
            msg,
        }
    }
}

impl PartialEq for DelayedMessage {
    fn eq(&self, other: &Self) -> bool {
        self.trigger == other.trigger && self.seq == other.seq
    }
}

impl Eq for DelayedMessage {}

impl PartialOrd for DelayedMessage {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DelayedMessage {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .trigger
            .cmp(&self.trigger)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BinaryHeap;
    use std::panic::Location;

    fn delayed(base: Instant, offset_ms: u64, seq: u64) -> DelayedMessage {
        let msg = Message::new(Location::caller(), None, seq as u32, None);
        let delay = Duration::from_millis(offset_ms);
        DelayedMessage::new(delay, base + delay, seq, msg)
    }

    #[test]
    fn test_earliest_trigger_pops_first() {
        let base = Instant::now();
        let mut heap = BinaryHeap::new();
        heap.push(delayed(base, 100, 0));
        heap.push(delayed(base, 50, 1));
        heap.push(delayed(base, 75, 2));

        let order: Vec<u64> = std::iter::from_fn(|| heap.pop().map(|d| d.seq)).collect();
        assert_eq!(order, vec![1, 2, 0]);
    }

    #[test]
    fn test_equal_triggers_pop_in_submission_order() {
        let base = Instant::now();
        let mut heap = BinaryHeap::new();
        for seq in [3, 0, 4, 1, 2] {
            heap.push(delayed(base, 10, seq));
        }

        let order: Vec<u64> = std::iter::from_fn(|| heap.pop().map(|d| d.seq)).collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
    }
}
