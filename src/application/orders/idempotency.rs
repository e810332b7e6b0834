//! TTL cache keyed by client-order-id: the second of the two named caches
//! in the system. Holds the last known terminal result per key so repeated
//! submissions observe identical outcomes.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub struct TtlCache<V> {
    inner: Mutex<HashMap<String, (Instant, V)>>,
    ttl: Duration,
}

impl<V: Clone> TtlCache<V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let map = self.inner.lock().expect("ttl cache lock poisoned");
        map.get(key).and_then(|(stored_at, value)| {
            if stored_at.elapsed() <= self.ttl {
                Some(value.clone())
            } else {
                None
            }
        })
    }

    pub fn insert(&self, key: &str, value: V) {
        let mut map = self.inner.lock().expect("ttl cache lock poisoned");
        map.insert(key.to_string(), (Instant::now(), value));
    }

    /// Drop expired entries; returns how many were removed. Driven by the
    /// scheduler's cache-retention job.
    pub fn purge_expired(&self) -> usize {
        let mut map = self.inner.lock().expect("ttl cache lock poisoned");
        let before = map.len();
        map.retain(|_, (stored_at, _)| stored_at.elapsed() <= self.ttl);
        before - map.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("ttl cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
