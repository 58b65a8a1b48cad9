//! Bounded memory of recently seen transaction numbers

use std::collections::{HashSet, VecDeque};
use std::sync::{Mutex, PoisonError};

/// Insertion-ordered set that forgets its oldest key once `capacity` is exceeded.
pub struct RecentSet {
    capacity: usize,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    keys: HashSet<String>,
    order: VecDeque<String>,
}

impl RecentSet {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Remember `key`; returns `false` if it was already known
    pub fn insert(&self, key: &str) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if !inner.keys.insert(key.to_string()) {
            return false;
        }
        inner.order.push_back(key.to_string());
        while inner.order.len() > self.capacity {
            if let Some(oldest) = inner.order.pop_front() {
                inner.keys.remove(&oldest);
            }
        }
        true
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys
            .contains(key)
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .order
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_reports_duplicates() {
        let set = RecentSet::new(4);
        assert!(set.insert("T1"));
        assert!(!set.insert("T1"));
        assert!(set.contains("T1"));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_oldest_key_is_forgotten() {
        let set = RecentSet::new(2);
        set.insert("T1");
        set.insert("T2");
        set.insert("T3");
        assert!(!set.contains("T1"));
        assert!(set.contains("T2"));
        assert!(set.contains("T3"));
        assert!(set.insert("T1"));
    }
}
