//! FIFO-bounded map.
//!
//! Backs the ledger's cid dedup window and each room's idempotency `seen`
//! window: insertion order is retained and the oldest entry is evicted once
//! the capacity is exceeded.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// A map bounded to `capacity` entries with first-in-first-out eviction.
///
/// Re-inserting an existing key updates the value but keeps the key's
/// original position in the eviction order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(
    serialize = "K: Serialize + Eq + Hash, V: Serialize",
    deserialize = "K: DeserializeOwned + Eq + Hash + Clone, V: DeserializeOwned"
))]
pub struct FifoMap<K, V> {
    capacity: usize,
    order: VecDeque<K>,
    entries: HashMap<K, V>,
}

impl<K: Eq + Hash + Clone, V> FifoMap<K, V> {
    /// Creates an empty map bounded to `capacity` entries.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            entries: HashMap::new(),
        }
    }

    /// Inserts `key → value`, evicting the oldest entry when full.
    pub fn insert(&mut self, key: K, value: V) {
        if self.entries.insert(key.clone(), value).is_none() {
            self.order.push_back(key);
            while self.order.len() > self.capacity {
                if let Some(oldest) = self.order.pop_front() {
                    self.entries.remove(&oldest);
                }
            }
        }
    }

    /// Looks up a key.
    #[must_use]
    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key)
    }

    /// True when the key is present.
    #[must_use]
    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    /// Number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no entries are held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The configured capacity.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_oldest_first() {
        let mut m = FifoMap::new(2);
        m.insert("a", 1);
        m.insert("b", 2);
        m.insert("c", 3);
        assert!(!m.contains(&"a"));
        assert_eq!(m.get(&"b"), Some(&2));
        assert_eq!(m.get(&"c"), Some(&3));
        assert_eq!(m.len(), 2);
    }

    #[test]
    fn reinsert_updates_without_duplicating_order() {
        let mut m = FifoMap::new(2);
        m.insert("a", 1);
        m.insert("a", 10);
        m.insert("b", 2);
        m.insert("c", 3);
        // "a" was oldest despite the update, so it goes first.
        assert!(!m.contains(&"a"));
        assert_eq!(m.len(), 2);
    }

    #[test]
    fn serde_round_trip() {
        let mut m: FifoMap<String, u64> = FifoMap::new(3);
        m.insert("x".into(), 7);
        let json = serde_json::to_string(&m).unwrap();
        let back: FifoMap<String, u64> = serde_json::from_str(&json).unwrap();
        assert_eq!(back.get(&"x".to_string()), Some(&7));
        assert_eq!(back.capacity(), 3);
    }
}
