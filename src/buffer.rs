//! Message buffers connecting controllers to the interconnect and to each
//! other.
//!
//! A buffer holds timed messages: a message enqueued with `ready_at` can not
//! be dequeued before that cycle. Ready times are clamped so they never
//! decrease along a queue, which keeps FIFO order intact.
//!
//! Ordered buffers keep a single queue shared by all producers. Unordered
//! buffers keep one lane per producer and serve the lanes round-robin, so
//! only per-producer order is guaranteed.

use std::collections::{BTreeMap, VecDeque};

use crate::common::{Cycle, MachineId};
use crate::error::BufferError;

struct Timed<T> {
    ready_at: Cycle,
    msg: T,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BufferStats {
    pub enqueued: u64,
    pub dequeued: u64,
    pub peak: usize,
    pub rejected: u64,
}

pub struct MessageBuffer<T> {
    capacity: usize,
    ordered: bool,
    // ordered buffers use the single lane keyed by `None`
    lanes: BTreeMap<Option<MachineId>, VecDeque<Timed<T>>>,
    // last lane served, unordered buffers resume after it
    cursor: Option<MachineId>,
    len: usize,
    stats: BufferStats,
}

impl<T> MessageBuffer<T> {
    /// `capacity == 0` means unbounded.
    pub fn new(capacity: usize, ordered: bool) -> Self {
        Self {
            capacity,
            ordered,
            lanes: BTreeMap::new(),
            cursor: None,
            len: 0,
            stats: BufferStats::default(),
        }
    }

    pub fn ordered(capacity: usize) -> Self {
        Self::new(capacity, true)
    }

    pub fn unordered(capacity: usize) -> Self {
        Self::new(capacity, false)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn stats(&self) -> BufferStats {
        self.stats
    }

    /// Whether `n` more messages fit.
    pub fn has_slots(&self, n: usize) -> bool {
        self.capacity == 0 || self.len + n <= self.capacity
    }

    pub fn enqueue(&mut self, sender: MachineId, msg: T, ready_at: Cycle) -> Result<(), BufferError> {
        if !self.has_slots(1) {
            self.stats.rejected += 1;
            return Err(BufferError::Overflow { capacity: self.capacity });
        }
        let key = (!self.ordered).then_some(sender);
        let lane = self.lanes.entry(key).or_default();
        let ready_at = lane.back().map_or(ready_at, |last| ready_at.max(last.ready_at));
        lane.push_back(Timed { ready_at, msg });
        self.len += 1;
        self.stats.enqueued += 1;
        self.stats.peak = self.stats.peak.max(self.len);
        Ok(())
    }

    /// Lane holding the next message ready at `now`.
    fn ready_lane(&self, now: Cycle) -> Option<Option<MachineId>> {
        let is_ready = |lane: &VecDeque<Timed<T>>| lane.front().is_some_and(|m| m.ready_at <= now);
        if self.ordered {
            return self.lanes.get(&None).filter(|l| is_ready(l)).map(|_| None);
        }
        // round-robin: lanes after the cursor first, then wrap around
        let after = self
            .lanes
            .iter()
            .filter(|(k, _)| self.cursor.map_or(true, |c| **k > Some(c)));
        let before = self
            .lanes
            .iter()
            .filter(|(k, _)| self.cursor.is_some_and(|c| **k <= Some(c)));
        after
            .chain(before)
            .find(|(_, lane)| is_ready(lane))
            .map(|(k, _)| *k)
    }

    pub fn is_ready(&self, now: Cycle) -> bool {
        self.ready_lane(now).is_some()
    }

    pub fn peek(&self, now: Cycle) -> Option<&T> {
        let key = self.ready_lane(now)?;
        self.lanes.get(&key).and_then(|l| l.front()).map(|m| &m.msg)
    }

    pub fn dequeue(&mut self, now: Cycle) -> Result<T, BufferError> {
        let key = self.ready_lane(now).ok_or(BufferError::Empty)?;
        let timed = self
            .lanes
            .get_mut(&key)
            .and_then(|l| l.pop_front())
            .ok_or(BufferError::Empty)?;
        if !self.ordered {
            self.cursor = key;
        }
        self.len -= 1;
        self.stats.dequeued += 1;
        Ok(timed.msg)
    }

    /// Earliest cycle at which some message becomes ready.
    pub fn next_ready(&self) -> Option<Cycle> {
        self.lanes.values().filter_map(|l| l.front()).map(|m| m.ready_at).min()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.lanes.values().flat_map(|l| l.iter().map(|m| &m.msg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: MachineId = MachineId::L1(0);
    const B: MachineId = MachineId::L1(1);

    #[test]
    fn fifth_enqueue_overflows() {
        let mut buf = MessageBuffer::ordered(4);
        for i in 0..4 {
            buf.enqueue(A, i, 0).unwrap();
        }
        assert!(!buf.has_slots(1));
        assert_eq!(buf.enqueue(A, 4, 0), Err(BufferError::Overflow { capacity: 4 }));
        assert_eq!(buf.len(), 4);
        assert_eq!(buf.stats().rejected, 1);
        buf.dequeue(0).unwrap();
        assert!(buf.enqueue(A, 4, 0).is_ok());
    }

    #[test]
    fn unbounded_never_overflows() {
        let mut buf = MessageBuffer::unordered(0);
        for i in 0..1000 {
            buf.enqueue(A, i, 0).unwrap();
        }
        assert_eq!(buf.stats().peak, 1000);
    }

    #[test]
    fn messages_wait_for_their_ready_time() {
        let mut buf = MessageBuffer::ordered(0);
        buf.enqueue(A, 'x', 5).unwrap();
        assert_eq!(buf.peek(4), None);
        assert_eq!(buf.dequeue(4), Err(BufferError::Empty));
        assert_eq!(buf.peek(5), Some(&'x'));
        assert_eq!(buf.dequeue(5), Ok('x'));
        assert!(buf.is_empty());
    }

    #[test]
    fn ordered_keeps_global_order() {
        let mut buf = MessageBuffer::ordered(0);
        buf.enqueue(A, 1, 3).unwrap();
        // ready earlier, but enqueued later
        buf.enqueue(B, 2, 1).unwrap();
        assert_eq!(buf.peek(1), None);
        assert_eq!(buf.dequeue(3), Ok(1));
        assert_eq!(buf.dequeue(3), Ok(2));
    }

    #[test]
    fn unordered_serves_producers_round_robin() {
        let mut buf = MessageBuffer::unordered(0);
        buf.enqueue(A, "a1", 0).unwrap();
        buf.enqueue(A, "a2", 0).unwrap();
        buf.enqueue(B, "b1", 0).unwrap();
        buf.enqueue(B, "b2", 0).unwrap();
        let order: Vec<_> = (0..4).map(|_| buf.dequeue(0).unwrap()).collect();
        assert_eq!(order, vec!["a1", "b1", "a2", "b2"]);
    }

    #[test]
    fn unordered_lane_not_ready_does_not_block_others() {
        let mut buf = MessageBuffer::unordered(0);
        buf.enqueue(A, "late", 10).unwrap();
        buf.enqueue(B, "early", 0).unwrap();
        assert_eq!(buf.dequeue(0), Ok("early"));
        assert_eq!(buf.next_ready(), Some(10));
    }
}
