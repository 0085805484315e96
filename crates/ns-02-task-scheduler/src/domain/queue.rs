//! # Task Queue
//!
//! Thread-safe, deduplicated FIFO of pending task parameters.
//!
//! ## Invariant
//!
//! `order` and `members` always hold exactly the same values, so the same
//! parameters can never be pending twice.

use super::task::TaskId;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;

struct QueueInner<T, K> {
    order: VecDeque<(K, T)>,
    members: HashSet<T>,
}

/// Deduplicated FIFO keyed by `K`.
pub struct TaskQueue<T, K = TaskId> {
    inner: Mutex<QueueInner<T, K>>,
}

impl<T, K> Default for TaskQueue<T, K> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                order: VecDeque::new(),
                members: HashSet::new(),
            }),
        }
    }
}

impl<T, K> TaskQueue<T, K>
where
    T: Clone + Eq + Hash,
    K: Copy + Eq,
{
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `value` unless an equal value is already pending.
    pub fn push(&self, key: K, value: T) -> bool {
        let mut inner = self.inner.lock();
        if !inner.members.insert(value.clone()) {
            return false;
        }
        inner.order.push_back((key, value));
        true
    }

    /// Remove the oldest pending entry.
    pub fn pop(&self) -> Option<(K, T)> {
        let mut inner = self.inner.lock();
        let (key, value) = inner.order.pop_front()?;
        inner.members.remove(&value);
        Some((key, value))
    }

    /// Remove the entry with `key`, returning its value.
    pub fn cancel_by_key(&self, key: &K) -> Option<T> {
        let mut inner = self.inner.lock();
        let position = inner.order.iter().position(|(k, _)| k == key)?;
        let (_, value) = inner.order.remove(position)?;
        inner.members.remove(&value);
        Some(value)
    }

    /// Remove the entry equal to `value`, returning its key.
    pub fn cancel_by_value(&self, value: &T) -> Option<K> {
        let mut inner = self.inner.lock();
        if !inner.members.remove(value) {
            return None;
        }
        let position = inner.order.iter().position(|(_, v)| v == value)?;
        inner.order.remove(position).map(|(key, _)| key)
    }

    /// Key of the pending entry equal to `value`.
    pub fn key_of(&self, value: &T) -> Option<K> {
        let inner = self.inner.lock();
        if !inner.members.contains(value) {
            return None;
        }
        inner
            .order
            .iter()
            .find(|(_, v)| v == value)
            .map(|(key, _)| *key)
    }

    /// Whether an entry with `key` is pending.
    pub fn contains_key(&self, key: &K) -> bool {
        self.inner.lock().order.iter().any(|(k, _)| k == key)
    }

    /// Point-in-time view of the pending entries.
    pub fn copy(&self) -> HashMap<T, K> {
        self.inner
            .lock()
            .order
            .iter()
            .map(|(key, value)| (value.clone(), *key))
            .collect()
    }

    /// Remove and return everything, oldest first.
    pub fn drain(&self) -> Vec<(K, T)> {
        let mut inner = self.inner.lock();
        inner.members.clear();
        inner.order.drain(..).collect()
    }

    pub fn size(&self) -> usize {
        self.inner.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().order.is_empty()
    }

    #[cfg(test)]
    fn is_consistent(&self) -> bool {
        let inner = self.inner.lock();
        inner.order.len() == inner.members.len()
            && inner.order.iter().all(|(_, v)| inner.members.contains(v))
    }
}
