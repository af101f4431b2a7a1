//! Rotation queue
//!
//! Indexed binary min-heap of `(next_fire, job_id)`. The side index maps
//! each id to its heap slot so removal and re-prioritising are `O(log n)`.
//! The queue holds ids only; jobs live in the manager.

use std::cmp::Ordering;
use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::job::JobId;

/// One queued fire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueEntry {
    /// Job to run
    pub id: JobId,
    /// When it is due
    pub next_fire: DateTime<Utc>,
}

impl Ord for QueueEntry {
    /// Earlier fire first; equal instants by lower id
    fn cmp(&self, other: &Self) -> Ordering {
        self.next_fire
            .cmp(&other.next_fire)
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Min-heap of job fires with at most one entry per job
#[derive(Debug, Default)]
pub struct RotationQueue {
    heap: Vec<QueueEntry>,
    index: HashMap<JobId, usize>,
}

impl RotationQueue {
    /// Empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of queued jobs
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Whether nothing is queued
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Whether `id` is queued
    pub fn contains(&self, id: &JobId) -> bool {
        self.index.contains_key(id)
    }

    /// Queued fire time of `id`
    pub fn get(&self, id: &JobId) -> Option<DateTime<Utc>> {
        self.index.get(id).map(|&slot| self.heap[slot].next_fire)
    }

    /// Queue `id`, or move it if already queued
    pub fn push(&mut self, id: JobId, next_fire: DateTime<Utc>) {
        if self.update(&id, next_fire) {
            return;
        }
        let slot = self.heap.len();
        self.heap.push(QueueEntry { id, next_fire });
        self.index.insert(id, slot);
        self.sift_up(slot);
    }

    /// Earliest entry without removing it
    pub fn peek(&self) -> Option<QueueEntry> {
        self.heap.first().copied()
    }

    /// Remove and return the earliest entry if it is due at `now`
    pub fn pop_ready(&mut self, now: DateTime<Utc>) -> Option<QueueEntry> {
        let head = self.peek()?;
        if head.next_fire > now {
            return None;
        }
        self.remove(&head.id)
    }

    /// Remove `id`; returns its entry if it was queued
    pub fn remove(&mut self, id: &JobId) -> Option<QueueEntry> {
        let slot = self.index.remove(id)?;
        let last = self.heap.len() - 1;
        self.heap.swap(slot, last);
        let removed = self.heap.pop();
        if slot < self.heap.len() {
            self.index.insert(self.heap[slot].id, slot);
            self.restore(slot);
        }
        removed
    }

    /// Change the fire time of a queued job; `false` if it is not queued
    pub fn update(&mut self, id: &JobId, next_fire: DateTime<Utc>) -> bool {
        let Some(&slot) = self.index.get(id) else {
            return false;
        };
        self.heap[slot].next_fire = next_fire;
        self.restore(slot);
        true
    }

    /// Entries in dispatch order
    pub fn ordered(&self) -> Vec<QueueEntry> {
        let mut entries = self.heap.clone();
        entries.sort();
        entries
    }

    fn restore(&mut self, slot: usize) {
        let slot = self.sift_up(slot);
        self.sift_down(slot);
    }

    fn sift_up(&mut self, mut slot: usize) -> usize {
        while slot > 0 {
            let parent = (slot - 1) / 2;
            if self.heap[slot] >= self.heap[parent] {
                break;
            }
            self.swap(slot, parent);
            slot = parent;
        }
        slot
    }

    fn sift_down(&mut self, mut slot: usize) {
        loop {
            let left = 2 * slot + 1;
            let right = left + 1;
            let mut smallest = slot;
            if left < self.heap.len() && self.heap[left] < self.heap[smallest] {
                smallest = left;
            }
            if right < self.heap.len() && self.heap[right] < self.heap[smallest] {
                smallest = right;
            }
            if smallest == slot {
                return;
            }
            self.swap(slot, smallest);
            slot = smallest;
        }
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.heap.swap(a, b);
        self.index.insert(self.heap[a].id, a);
        self.index.insert(self.heap[b].id, b);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use uuid::Uuid;

    fn id(n: u128) -> JobId {
        JobId::from_uuid(Uuid::from_u128(n))
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_735_732_800 + secs, 0).unwrap()
    }

    #[test]
    fn test_pop_ready_only_when_due() {
        let mut queue = RotationQueue::new();
        queue.push(id(1), at(10));

        assert_eq!(queue.pop_ready(at(9)), None);
        assert_eq!(queue.pop_ready(at(10)), Some(QueueEntry { id: id(1), next_fire: at(10) }));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_ties_break_by_lower_id() {
        let mut queue = RotationQueue::new();
        queue.push(id(9), at(5));
        queue.push(id(3), at(5));
        queue.push(id(7), at(5));

        let order: Vec<_> = std::iter::from_fn(|| queue.pop_ready(at(5)).map(|e| e.id)).collect();
        assert_eq!(order, [id(3), id(7), id(9)]);
    }

    #[test]
    fn test_push_existing_moves_it() {
        let mut queue = RotationQueue::new();
        queue.push(id(1), at(10));
        queue.push(id(2), at(20));
        queue.push(id(2), at(5));

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.peek().map(|e| e.id), Some(id(2)));
        assert_eq!(queue.get(&id(2)), Some(at(5)));
    }

    #[test]
    fn test_remove_and_update() {
        let mut queue = RotationQueue::new();
        for n in 1..=5 {
            queue.push(id(n), at(n as i64 * 10));
        }
        assert!(queue.remove(&id(1)).is_some());
        assert!(queue.remove(&id(1)).is_none());
        assert!(queue.update(&id(5), at(0)));
        assert!(!queue.update(&id(42), at(0)));

        let order: Vec<_> = queue.ordered().into_iter().map(|e| e.id).collect();
        assert_eq!(order, [id(5), id(2), id(3), id(4)]);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Push(u8, i64),
        Remove(u8),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..16, 0i64..50).prop_map(|(i, t)| Op::Push(i, t)),
            (0u8..16).prop_map(Op::Remove),
        ]
    }

    proptest! {
        #[test]
        fn prop_pops_in_order_with_one_entry_per_job(ops in proptest::collection::vec(op(), 0..200)) {
            let mut queue = RotationQueue::new();
            let mut model = HashMap::new();
            for op in ops {
                match op {
                    Op::Push(i, t) => {
                        queue.push(id(i.into()), at(t));
                        model.insert(id(i.into()), at(t));
                    }
                    Op::Remove(i) => {
                        prop_assert_eq!(queue.remove(&id(i.into())).is_some(), model.remove(&id(i.into())).is_some());
                    }
                }
            }
            prop_assert_eq!(queue.len(), model.len());

            let mut expected: Vec<_> = model
                .into_iter()
                .map(|(id, next_fire)| QueueEntry { id, next_fire })
                .collect();
            expected.sort();
            let popped: Vec<_> = std::iter::from_fn(|| queue.pop_ready(at(100))).collect();
            prop_assert_eq!(popped, expected);
        }
    }
}
