//! Indexed priority queue
//!
//! A binary max-heap keyed by an ordered key, with a side map from entry to
//! heap slot for O(1) membership tests and O(log n) removal from the middle.
//! Duplicate entries are rejected.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::hash::Hash;

/// Priority queue with constant-time search and removal from the middle.
///
/// `K` orders entries with `Ord`: the greatest key is popped first.
#[derive(Debug)]
pub struct IndexedPriorityQueue<T, K> {
    entries: Vec<(T, K)>,
    slot_of: HashMap<T, usize>,
    rng: StdRng,
}

impl<T, K> IndexedPriorityQueue<T, K>
where
    T: Copy + Eq + Hash,
    K: Ord,
{
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::with_seed(0)
    }

    /// Create an empty queue with a deterministic seed for `random_entry`.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            entries: Vec::new(),
            slot_of: HashMap::new(),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Insert an entry with its key. Returns false if already present.
    pub fn push(&mut self, entry: T, key: K) -> bool {
        if self.slot_of.contains_key(&entry) {
            return false;
        }
        self.entries.push((entry, key));
        let node = self.entries.len() - 1;
        self.slot_of.insert(entry, node);
        self.percolate_up(node);
        true
    }

    /// The best entry, if any.
    pub fn top(&self) -> Option<T> {
        self.entries.first().map(|(e, _)| *e)
    }

    /// Remove and return the best entry.
    pub fn pop(&mut self) -> Option<T> {
        let top = self.top()?;
        self.erase(&top);
        Some(top)
    }

    /// The entry in the numerically last heap slot: the one least likely to
    /// run soon. Used when shedding load.
    pub fn back(&self) -> Option<T> {
        self.entries.last().map(|(e, _)| *e)
    }

    /// A uniformly random entry.
    pub fn random_entry(&mut self) -> Option<T> {
        if self.entries.is_empty() {
            return None;
        }
        let slot = self.rng.gen_range(0..self.entries.len());
        Some(self.entries[slot].0)
    }

    /// Whether the entry is present.
    pub fn contains(&self, entry: &T) -> bool {
        self.slot_of.contains_key(entry)
    }

    /// Remove an arbitrary entry. Returns false if absent.
    pub fn erase(&mut self, entry: &T) -> bool {
        let Some(&node) = self.slot_of.get(entry) else {
            return false;
        };
        let last = self.entries.len() - 1;
        self.slot_of.remove(entry);
        if node == last {
            self.entries.pop();
            return true;
        }
        self.entries.swap(node, last);
        self.entries.pop();
        self.slot_of.insert(self.entries[node].0, node);
        // The replacement may belong above or below the hole.
        self.percolate_down(node);
        self.percolate_up(node);
        true
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Visit entries in unspecified order (diagnostics).
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter().map(|(e, _)| e)
    }

    fn better(&self, a: usize, b: usize) -> bool {
        self.entries[a].1 > self.entries[b].1
    }

    fn percolate_up(&mut self, mut node: usize) {
        while node > 0 {
            let parent = (node - 1) / 2;
            if !self.better(node, parent) {
                return;
            }
            self.entries.swap(node, parent);
            self.slot_of.insert(self.entries[node].0, node);
            self.slot_of.insert(self.entries[parent].0, parent);
            node = parent;
        }
    }

    fn percolate_down(&mut self, mut node: usize) {
        loop {
            let left = node * 2 + 1;
            let right = node * 2 + 2;
            let mut best = node;
            if left < self.entries.len() && self.better(left, best) {
                best = left;
            }
            if right < self.entries.len() && self.better(right, best) {
                best = right;
            }
            if best == node {
                return;
            }
            self.entries.swap(node, best);
            self.slot_of.insert(self.entries[node].0, node);
            self.slot_of.insert(self.entries[best].0, best);
            node = best;
        }
    }
}

impl<T, K> Default for IndexedPriorityQueue<T, K>
where
    T: Copy + Eq + Hash,
    K: Ord,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::Reverse;

    #[test]
    fn test_basics() {
        // Min-queue via Reverse keys.
        let mut q: IndexedPriorityQueue<i32, Reverse<i32>> = IndexedPriorityQueue::new();
        assert!(!q.contains(&4));
        q.push(4, Reverse(4));
        assert!(q.contains(&4));
        assert_eq!(q.top(), Some(4));
        q.push(3, Reverse(3));
        assert_eq!(q.top(), Some(3));
        q.push(5, Reverse(5));
        assert_eq!(q.top(), Some(3));
        q.pop();
        assert_eq!(q.top(), Some(4));
        assert!(!q.contains(&3));
        q.push(6, Reverse(6));
        assert!(q.contains(&5));
        assert!(q.erase(&5));
        assert!(!q.contains(&5));
        assert_eq!(q.top(), Some(4));
        q.pop();
        assert!(!q.contains(&4));
        assert_eq!(q.top(), Some(6));
    }

    #[test]
    fn test_duplicates_rejected() {
        let mut q: IndexedPriorityQueue<i32, i32> = IndexedPriorityQueue::new();
        assert!(q.push(1, 10));
        assert!(!q.push(1, 20));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_erase_interior_keeps_order() {
        let mut q: IndexedPriorityQueue<i32, i32> = IndexedPriorityQueue::new();
        for v in [10, 40, 20, 50, 30] {
            q.push(v, v);
        }
        assert!(q.erase(&40));
        let mut drained = Vec::new();
        while let Some(e) = q.pop() {
            drained.push(e);
        }
        assert_eq!(drained, vec![50, 30, 20, 10]);
    }

    #[test]
    fn test_back_is_a_worst_entry() {
        let mut q: IndexedPriorityQueue<i32, i32> = IndexedPriorityQueue::new();
        for v in [3, 1, 4, 11, 5] {
            q.push(v, v);
        }
        // The last slot is a leaf: never the best entry.
        let back = q.back().unwrap();
        assert_ne!(back, q.top().unwrap());
    }

    #[test]
    fn test_random_entry_in_range() {
        let mut q: IndexedPriorityQueue<i32, i32> = IndexedPriorityQueue::with_seed(7);
        for v in 0..10 {
            q.push(v, v);
        }
        for _ in 0..20 {
            let e = q.random_entry().unwrap();
            assert!((0..10).contains(&e));
        }
    }

    #[test]
    fn test_empty_queue() {
        let mut q: IndexedPriorityQueue<i32, i32> = IndexedPriorityQueue::new();
        assert!(q.is_empty());
        assert_eq!(q.top(), None);
        assert_eq!(q.pop(), None);
        assert_eq!(q.back(), None);
        assert_eq!(q.random_entry(), None);
    }
}
