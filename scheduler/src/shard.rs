// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use parking_lot::Mutex;

use build_graph::Priority;

/// One entry in a shard's ready queue: everything the priority comparator
/// needs, without a round-trip through the graph on every dequeue.
#[derive(Debug, Clone, Eq, PartialEq)]
pub(crate) struct ReadyItem {
    pub(crate) id: String,
    pub(crate) priority: Priority,
    /// Longest path from a root to this node. Deeper actions unblock more
    /// of the remaining graph when they complete, so — among actions of
    /// equal priority — they dequeue first.
    pub(crate) depth: u32,
    /// Monotonic insertion counter; the tie-break of last resort so two
    /// actions of equal priority and depth dequeue in submission order.
    pub(crate) tick: u64,
}

impl Ord for ReadyItem {
    fn cmp(&self, other: &Self) -> Ordering {
        // `BinaryHeap` is a max-heap: the ordering below must rank the item
        // that should dequeue *first* as the greatest. Earlier tick must
        // sort greater, hence the reversed final comparison.
        self.priority
            .cmp(&other.priority)
            .then_with(|| self.depth.cmp(&other.depth))
            .then_with(|| other.tick.cmp(&self.tick))
    }
}

impl PartialOrd for ReadyItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// One shard of the Scheduler's sharded ready queue: an independent lock
/// plus priority heap. Sharding bounds dequeue/enqueue contention to
/// `O(1/N)` of a single global queue, at the cost of only approximate
/// global priority ordering (see the two-pass dequeue in `dispatch.rs`).
#[derive(Default)]
pub(crate) struct Shard {
    queue: Mutex<BinaryHeap<ReadyItem>>,
}

impl Shard {
    pub(crate) fn push(&self, item: ReadyItem) {
        self.queue.lock().push(item);
    }

    /// Pop the top item, but only if it's at least `min_priority`. Used for
    /// the scheduler's first (High/Critical-only) dequeue pass.
    pub(crate) fn pop_if_at_least(&self, min_priority: Priority) -> Option<ReadyItem> {
        let mut q = self.queue.lock();
        match q.peek() {
            Some(top) if top.priority >= min_priority => q.pop(),
            _ => None,
        }
    }

    pub(crate) fn pop(&self) -> Option<ReadyItem> {
        self.queue.lock().pop()
    }
}

/// Number of shards to use for a given configured hint: at least 16, and
/// always a power of two so `hash % N` is a cheap mask.
pub(crate) fn shard_count_for(hint: usize) -> usize {
    hint.max(16).next_power_of_two()
}

/// `hash(action_id) mod N`, per the sharding scheme.
pub(crate) fn shard_index(id: &str, shard_count: usize) -> usize {
    use std::hash::Hasher;
    let mut hasher = fnv::FnvHasher::default();
    hasher.write(id.as_bytes());
    (hasher.finish() as usize) % shard_count
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: &str, priority: Priority, depth: u32, tick: u64) -> ReadyItem {
        ReadyItem {
            id: id.to_string(),
            priority,
            depth,
            tick,
        }
    }

    #[test]
    fn higher_priority_dequeues_first() {
        let shard = Shard::default();
        shard.push(item("//low", Priority::Low, 0, 0));
        shard.push(item("//crit", Priority::Critical, 0, 1));
        assert_eq!(shard.pop().unwrap().id, "//crit");
        assert_eq!(shard.pop().unwrap().id, "//low");
    }

    #[test]
    fn equal_priority_prefers_greater_depth() {
        let shard = Shard::default();
        shard.push(item("//shallow", Priority::Normal, 1, 0));
        shard.push(item("//deep", Priority::Normal, 5, 1));
        assert_eq!(shard.pop().unwrap().id, "//deep");
    }

    #[test]
    fn equal_priority_and_depth_is_fifo_by_tick() {
        let shard = Shard::default();
        shard.push(item("//second", Priority::Normal, 0, 2));
        shard.push(item("//first", Priority::Normal, 0, 1));
        assert_eq!(shard.pop().unwrap().id, "//first");
        assert_eq!(shard.pop().unwrap().id, "//second");
    }

    #[test]
    fn pop_if_at_least_skips_queues_below_the_threshold() {
        let shard = Shard::default();
        shard.push(item("//normal", Priority::Normal, 0, 0));
        assert!(shard.pop_if_at_least(Priority::High).is_none());
        assert!(shard.pop_if_at_least(Priority::Normal).is_some());
    }

    #[test]
    fn shard_count_is_a_power_of_two_at_least_sixteen() {
        assert_eq!(shard_count_for(1), 16);
        assert_eq!(shard_count_for(16), 16);
        assert_eq!(shard_count_for(17), 32);
        assert_eq!(shard_count_for(1000), 1024);
    }
}
