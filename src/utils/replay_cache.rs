//! Completed-request cache
//!
//! Remembers which request keys were already answered, so a response that arrives after
//! a retransmission won the race is dropped instead of showing up as an unsolicited event.
//!
//! Entries expire after a TTL and the cache is bounded; the oldest entry is evicted first.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::time::{Duration, Instant};
use tracing::debug;

/// TTL-based set of keys with O(1) FIFO eviction
#[derive(Debug)]
pub struct ReplayCache<K> {
    entries: HashMap<K, Instant>,
    /// Insertion order for FIFO eviction
    insertion_order: VecDeque<K>,
    ttl: Duration,
    max_entries: usize,
}

impl<K: Hash + Eq + Clone> ReplayCache<K> {
    /// Default TTL: 60 seconds, default max entries: 10,000
    pub fn new() -> Self {
        Self::with_settings(Duration::from_secs(60), 10_000)
    }

    pub fn with_settings(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: HashMap::new(),
            insertion_order: VecDeque::new(),
            ttl,
            max_entries: max_entries.max(1),
        }
    }

    /// Record `key`. Returns true if it was already present (a replay).
    pub fn insert(&mut self, key: K) -> bool {
        self.cleanup_expired();
        if self.entries.contains_key(&key) {
            return true;
        }
        if self.entries.len() >= self.max_entries {
            let to_remove = self.entries.len() - self.max_entries + 1;
            self.remove_oldest_entries(to_remove);
        }
        self.entries.insert(key.clone(), Instant::now());
        self.insertion_order.push_back(key);
        false
    }

    /// Whether `key` was recorded and has not expired
    pub fn contains(&self, key: &K) -> bool {
        self.entries
            .get(key)
            .is_some_and(|added| added.elapsed() < self.ttl)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn cleanup_expired(&mut self) {
        let ttl = self.ttl;
        // Insertion order is also age order, so expired keys sit at the front
        while let Some(key) = self.insertion_order.front() {
            match self.entries.get(key) {
                Some(added) if added.elapsed() < ttl => break,
                _ => {
                    if let Some(key) = self.insertion_order.pop_front() {
                        self.entries.remove(&key);
                    }
                }
            }
        }
    }

    fn remove_oldest_entries(&mut self, count: usize) {
        for _ in 0..count {
            if let Some(key) = self.insertion_order.pop_front() {
                self.entries.remove(&key);
            }
        }
        debug!(count, "Evicted oldest completed-request entries");
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.insertion_order.clear();
    }
}

impl<K: Hash + Eq + Clone> Default for ReplayCache<K> {
    fn default() -> Self {
        Self::new()
    }
}
