use std::collections::{HashSet, VecDeque};
use std::hash::Hash;

/// Bounded "already seen" set.
///
/// Keeps at most `capacity` keys; inserting past the ceiling evicts the
/// oldest key first. Suppression is best-effort: a key evicted from the ring
/// will be treated as new if it shows up again.
#[derive(Debug, Clone)]
pub struct DedupRing<K> {
    order: VecDeque<K>,
    seen: HashSet<K>,
    capacity: usize,
}

impl<K: Eq + Hash + Clone> DedupRing<K> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            order: VecDeque::with_capacity(capacity + 1),
            seen: HashSet::with_capacity(capacity + 1),
            capacity,
        }
    }

    /// Record `key`. Returns `true` when it was not already present.
    pub fn insert(&mut self, key: K) -> bool {
        if self.seen.contains(&key) {
            return false;
        }
        self.seen.insert(key.clone());
        self.order.push_back(key);
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.seen.remove(&old);
            }
        }
        true
    }

    pub fn contains(&self, key: &K) -> bool {
        self.seen.contains(key)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.seen.clear();
    }
}
