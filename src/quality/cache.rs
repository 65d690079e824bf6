//! TTL caches that drop values computed across an invalidation
//!
//! A value is computed from store reads that take time. If the key is
//! invalidated while that is happening, the finished value is already stale
//! and must not be cached. Callers take a [`Ticket`] before reading, and the
//! insert is refused when the key (or the whole cache) was invalidated since.

use dashmap::DashMap;
use moka::sync::Cache;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket {
    global: u64,
    key: u64,
}

pub struct GuardedCache<V> {
    inner: Cache<String, V>,
    epochs: DashMap<String, u64>,
    global: AtomicU64,
}

impl<V: Clone + Send + Sync + 'static> GuardedCache<V> {
    pub fn new(capacity: u64, ttl: Duration) -> Self {
        Self {
            inner: Cache::builder().max_capacity(capacity).time_to_live(ttl).build(),
            epochs: DashMap::new(),
            global: AtomicU64::new(0),
        }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        self.inner.get(key)
    }

    /// Take before reading anything the value depends on
    pub fn ticket(&self, key: &str) -> Ticket {
        Ticket {
            global: self.global.load(Ordering::SeqCst),
            key: self.epochs.get(key).map(|e| *e).unwrap_or(0),
        }
    }

    /// Cache `value` unless `key` was invalidated after `ticket` was taken.
    /// Returns whether the value was kept.
    pub fn insert(&self, key: &str, ticket: Ticket, value: V) -> bool {
        if self.ticket(key) != ticket {
            return false;
        }
        self.inner.insert(key.to_string(), value);
        // An invalidation can land between the check and the insert
        if self.ticket(key) != ticket {
            self.inner.invalidate(key);
            return false;
        }
        true
    }

    pub fn invalidate(&self, key: &str) {
        *self.epochs.entry(key.to_string()).or_insert(0) += 1;
        self.inner.invalidate(key);
    }

    /// Refuse every insert whose ticket predates this call, keeping cached values
    pub fn discard_in_flight(&self) {
        self.global.fetch_add(1, Ordering::SeqCst);
    }

    pub fn invalidate_all(&self) {
        self.discard_in_flight();
        self.inner.invalidate_all();
    }

    pub fn iter(&self) -> impl Iterator<Item = (Arc<String>, V)> + '_ {
        self.inner.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> GuardedCache<u32> {
        GuardedCache::new(100, Duration::from_secs(60))
    }

    #[test]
    fn test_insert_with_current_ticket() {
        let c = cache();
        let ticket = c.ticket("a");
        assert!(c.insert("a", ticket, 1));
        assert_eq!(c.get("a"), Some(1));
    }

    #[test]
    fn test_invalidated_key_refuses_stale_value() {
        let c = cache();
        let ticket = c.ticket("a");
        c.invalidate("a");
        assert!(!c.insert("a", ticket, 1));
        assert_eq!(c.get("a"), None);

        // other keys are unaffected
        let other = c.ticket("b");
        assert!(c.insert("b", other, 2));
    }

    #[test]
    fn test_discard_in_flight_keeps_cached_values() {
        let c = cache();
        let first = c.ticket("a");
        c.insert("a", first, 1);
        let pending = c.ticket("b");
        c.discard_in_flight();
        assert!(!c.insert("b", pending, 2));
        assert_eq!(c.get("a"), Some(1));
    }
}
