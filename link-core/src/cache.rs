//! Bounded id set.
//!
//! Tracks recently seen ids (synced message keys, uploaded attachment
//! hashes, processed command ids) with:
//! - O(1) membership checks
//! - insertion-order eviction once the capacity is reached
//! - explicit `clear()` for sign-out
//!
//! Owners wrap it in a mutex; this type itself does no locking.

use std::collections::{HashSet, VecDeque};
use std::hash::Hash;

/// Set of ids that forgets the oldest entry when full.
#[derive(Debug, Clone)]
pub struct BoundedIdSet<T> {
    capacity: usize,
    order: VecDeque<T>,
    members: HashSet<T>,
}

impl<T: Clone + Eq + Hash> BoundedIdSet<T> {
    /// Create an empty set holding at most `capacity` ids.
    ///
    /// A capacity of zero is treated as one.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            members: HashSet::new(),
        }
    }

    /// Whether the id is present.
    pub fn contains(&self, id: &T) -> bool {
        self.members.contains(id)
    }

    /// Insert an id. Returns `false` if it was already present.
    ///
    /// When full, the oldest id is evicted first.
    pub fn insert(&mut self, id: T) -> bool {
        if self.members.contains(&id) {
            return false;
        }
        self.insert_evicting(id);
        true
    }

    /// Insert an id and return the id evicted to make room, if any.
    ///
    /// An id already present is left where it is.
    pub fn insert_evicting(&mut self, id: T) -> Option<T> {
        if self.members.contains(&id) {
            return None;
        }
        let mut evicted = None;
        if self.order.len() >= self.capacity {
            evicted = self.order.pop_front();
            if let Some(oldest) = &evicted {
                self.members.remove(oldest);
            }
        }
        self.order.push_back(id.clone());
        self.members.insert(id);
        evicted
    }

    /// Remove an id. Returns `true` if it was present.
    pub fn remove(&mut self, id: &T) -> bool {
        if !self.members.remove(id) {
            return false;
        }
        self.order.retain(|x| x != id);
        true
    }

    /// Number of ids held.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Maximum number of ids held.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Forget everything.
    pub fn clear(&mut self) {
        self.order.clear();
        self.members.clear();
    }
}
