use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;

/// Time-windowed membership set used by transports to drop replays.
///
/// Entries are collected lazily on `add`: the oldest records are walked in
/// insertion order and removed once older than `ttl`, stopping at the first
/// fresh one. Insertion order implies non-decreasing age, so the walk is
/// amortized O(1) and memory stays bounded without a timer.
#[derive(Debug)]
pub struct DedupSet<K> {
    ttl_ms: u64,
    clock: Arc<dyn Clock>,
    members: HashMap<K, u64>,
    order: VecDeque<(K, u64)>,
}

impl<K> DedupSet<K>
where
    K: Hash + Eq + Clone,
{
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            ttl_ms: ttl.as_millis() as u64,
            clock,
            members: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Inserts (or refreshes) `key`, then collects expired entries.
    pub fn add(&mut self, key: K) {
        let now = self.clock.now_ms();
        self.members.insert(key.clone(), now);
        self.order.push_back((key, now));
        self.collect(now);
    }

    pub fn has(&self, key: &K) -> bool {
        self.members.contains_key(key)
    }

    pub fn clear(&mut self) {
        self.members.clear();
        self.order.clear();
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    fn collect(&mut self, now: u64) {
        while let Some((key, inserted_at)) = self.order.front() {
            if now.saturating_sub(*inserted_at) <= self.ttl_ms {
                break;
            }
            // A re-added key leaves a stale record behind; only the record that
            // matches the live timestamp removes membership.
            if self.members.get(key) == Some(inserted_at) {
                self.members.remove(key);
            }
            self.order.pop_front();
        }
    }
}
