//! Key/value cache whose entries expire a fixed time after their last refresh.
//!
//! Used for ephemeral presence state (remote cursors, "user is typing"
//! flags). Time is passed in explicitly so callers and tests control the clock.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct Entry<V> {
    value: V,
    expires_at: Instant,
}

/// A map whose entries disappear `ttl` after they were last written.
#[derive(Debug, Clone)]
pub struct TtlCache<K, V> {
    entries: HashMap<K, Entry<V>>,
    ttl: Duration,
}

impl<K: Eq + Hash + Clone, V> TtlCache<K, V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Insert or overwrite `key`, restarting its expiry clock.
    pub fn insert(&mut self, key: K, value: V, now: Instant) -> Option<V> {
        let entry = Entry {
            value,
            expires_at: now + self.ttl,
        };
        self.entries.insert(key, entry).map(|e| e.value)
    }

    /// Restart the expiry clock of an existing entry. Returns `false` if absent.
    pub fn refresh(&mut self, key: &K, now: Instant) -> bool {
        match self.entries.get_mut(key) {
            Some(entry) => {
                entry.expires_at = now + self.ttl;
                true
            }
            None => false,
        }
    }

    /// Live value for `key`, ignoring entries that have expired but not yet
    /// been purged.
    pub fn get(&self, key: &K, now: Instant) -> Option<&V> {
        self.entries
            .get(key)
            .filter(|e| e.expires_at > now)
            .map(|e| &e.value)
    }

    pub fn get_mut(&mut self, key: &K, now: Instant) -> Option<&mut V> {
        self.entries
            .get_mut(key)
            .filter(|e| e.expires_at > now)
            .map(|e| &mut e.value)
    }

    /// When `key` expires, if present.
    pub fn expires_at(&self, key: &K) -> Option<Instant> {
        self.entries.get(key).map(|e| e.expires_at)
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.entries.remove(key).map(|e| e.value)
    }

    /// Drop every expired entry and return their keys.
    pub fn purge_expired(&mut self, now: Instant) -> Vec<K> {
        let expired: Vec<K> = self
            .entries
            .iter()
            .filter(|(_, e)| e.expires_at <= now)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            self.entries.remove(key);
        }
        expired
    }

    /// Mutable access to every entry regardless of expiry.
    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut V> {
        self.entries.values_mut().map(|e| &mut e.value)
    }

    /// Live entries at `now`.
    pub fn iter(&self, now: Instant) -> impl Iterator<Item = (&K, &V)> {
        self.entries
            .iter()
            .filter(move |(_, e)| e.expires_at > now)
            .map(|(k, e)| (k, &e.value))
    }

    /// Number of stored entries, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
