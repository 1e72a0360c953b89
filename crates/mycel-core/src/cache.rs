//! Bounded TTL cache with lowest-expiry eviction.
//!
//! Backs the sequence cache, the retransmit packet cache, and the gossip
//! message cache. Time is passed in by the caller (milliseconds), so the
//! cache itself holds no clock; lookups lazily expire.

use std::collections::HashMap;
use std::hash::Hash;

/// Bounded key → (expiry, value) map.
#[derive(Debug, Clone)]
pub struct TtlCache<K, V> {
    limit: usize,
    items: HashMap<K, (u64, V)>,
    lowest_expiry: Option<u64>,
}

impl<K: Eq + Hash + Clone, V> TtlCache<K, V> {
    pub fn new(limit: usize) -> Self {
        TtlCache { limit, items: HashMap::new(), lowest_expiry: None }
    }

    /// Insert with a TTL in seconds. Replaces any existing entry for the
    /// key; at capacity, the entry with the soonest expiry is evicted.
    pub fn add(&mut self, key: K, value: V, ttl_s: u64, now_ms: u64) {
        self.items.remove(&key);
        if self.items.len() >= self.limit {
            self.remove_lowest_expiry();
        }
        let expiry = now_ms + ttl_s * 1000;
        self.items.insert(key, (expiry, value));
        if self.lowest_expiry.map_or(true, |low| expiry < low) {
            self.lowest_expiry = Some(expiry);
        }
    }

    /// Look up a key, dropping it if expired.
    pub fn get(&mut self, key: &K, now_ms: u64) -> Option<&V> {
        let expired = match self.items.get(key) {
            Some((expiry, _)) => *expiry < now_ms,
            None => return None,
        };
        if expired {
            self.items.remove(key);
            return None;
        }
        self.items.get(key).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.lowest_expiry = None;
    }

    /// Iterate live entries without expiring them.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.items.iter().map(|(k, (_, v))| (k, v))
    }

    fn remove_lowest_expiry(&mut self) {
        if let Some(low) = self.lowest_expiry {
            if let Some(key) = self
                .items
                .iter()
                .find(|(_, (exp, _))| *exp == low)
                .map(|(k, _)| k.clone())
            {
                self.items.remove(&key);
            }
        }
        self.lowest_expiry = self.items.values().map(|(exp, _)| *exp).min();
    }

    /// Sweep out every expired entry.
    pub fn invalidate_expired(&mut self, now_ms: u64) {
        self.items.retain(|_, (exp, _)| *exp >= now_ms);
        self.lowest_expiry = self.items.values().map(|(exp, _)| *exp).min();
    }
}
