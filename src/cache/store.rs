//! Bounded entry store shared by both caches.
//!
//! Callers wrap the store in a single lock so that counter updates,
//! expiry and eviction happen atomically with each lookup.

use std::collections::HashMap;
use std::hash::Hash;

use chrono::{DateTime, Duration, Utc};
use log::debug;

use super::{CachePolicy, CacheStats, DISABLED};
use crate::config::CacheConfig;

#[derive(Debug, Clone)]
pub(crate) struct CacheEntry<V> {
    pub value: V,
    pub hits: u64,
    pub added: DateTime<Utc>,
    pub last_hit: Option<DateTime<Utc>>,
    /// Logical clock value of the last insert or hit; orders LRU eviction.
    touched: u64,
    /// Logical clock value of the insert; breaks LFU ties.
    inserted: u64,
}

#[derive(Debug)]
pub(crate) struct EvictingStore<K, V> {
    entries: HashMap<K, CacheEntry<V>>,
    max_size: i64,
    policy: CachePolicy,
    max_age: Duration,
    hits: u64,
    misses: u64,
    last_purge: Option<DateTime<Utc>>,
    clock: u64,
}

impl<K, V> EvictingStore<K, V>
where
    K: Eq + Hash + Clone + std::fmt::Debug,
{
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            entries: HashMap::new(),
            max_size: config.max_size,
            policy: config.policy,
            max_age: Duration::seconds(config.max_age_secs),
            hits: 0,
            misses: 0,
            last_purge: None,
            clock: 0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.max_size != DISABLED
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Drops entries older than the maximum age. Only LFU expires by age.
    pub fn expire(&mut self, now: DateTime<Utc>) -> usize {
        if self.policy != CachePolicy::Lfu {
            return 0;
        }
        let max_age = self.max_age;
        let before = self.entries.len();
        self.entries.retain(|key, entry| {
            let keep = now - entry.added <= max_age;
            if !keep {
                debug!("Cache entry {:?} expired", key);
            }
            keep
        });
        before - self.entries.len()
    }

    pub fn find<F>(&self, predicate: F) -> Option<K>
    where
        F: Fn(&K, &V) -> bool,
    {
        self.entries
            .iter()
            .find(|(key, entry)| predicate(key, &entry.value))
            .map(|(key, _)| key.clone())
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key).map(|entry| &entry.value)
    }

    pub fn record_hit(&mut self, key: &K, now: DateTime<Utc>) -> Option<&V> {
        self.clock += 1;
        let tick = self.clock;
        match self.entries.get_mut(key) {
            Some(entry) => {
                entry.hits += 1;
                entry.last_hit = Some(now);
                entry.touched = tick;
                self.hits += 1;
                Some(&entry.value)
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    pub fn record_miss(&mut self) {
        self.misses += 1;
    }

    /// Inserts or replaces `key`. A new key evicts first when the store is
    /// at capacity; replacing an existing key never evicts.
    pub fn insert(&mut self, key: K, value: V, now: DateTime<Utc>) {
        if !self.is_enabled() {
            return;
        }
        self.clock += 1;
        let tick = self.clock;

        if let Some(entry) = self.entries.get_mut(&key) {
            entry.value = value;
            entry.added = now;
            entry.touched = tick;
            entry.inserted = tick;
            return;
        }

        self.expire(now);
        while self.max_size > 0 && self.entries.len() as i64 >= self.max_size {
            if self.evict_one().is_none() {
                break;
            }
        }

        self.entries.insert(
            key,
            CacheEntry {
                value,
                hits: 0,
                added: now,
                last_hit: None,
                touched: tick,
                inserted: tick,
            },
        );
    }

    pub fn evict_one(&mut self) -> Option<K> {
        let victim = match self.policy {
            CachePolicy::Lru => self
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.touched)
                .map(|(key, _)| key.clone()),
            CachePolicy::Lfu => self
                .entries
                .iter()
                .min_by_key(|(_, entry)| (entry.hits, entry.inserted))
                .map(|(key, _)| key.clone()),
        }?;

        debug!("Evicting cache entry {:?} ({} policy)", victim, self.policy);
        self.entries.remove(&victim);
        Some(victim)
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.entries.remove(key).map(|entry| entry.value)
    }

    pub fn purge(&mut self, now: DateTime<Utc>) -> usize {
        let purged = self.entries.len();
        self.entries.clear();
        self.last_purge = Some(now);
        purged
    }

    /// Changes the capacity, evicting down to the new bound if needed.
    pub fn set_max_size(&mut self, max_size: i64) {
        self.max_size = max_size;
        if max_size == DISABLED {
            self.entries.clear();
            return;
        }
        while max_size > 0 && self.entries.len() as i64 > max_size {
            if self.evict_one().is_none() {
                break;
            }
        }
    }

    pub fn set_policy(&mut self, policy: CachePolicy) {
        self.policy = policy;
    }

    pub fn set_max_age(&mut self, max_age: Duration) {
        self.max_age = max_age;
    }

    pub fn entries(&self) -> impl Iterator<Item = (&K, &CacheEntry<V>)> {
        self.entries.iter()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            size: self.entries.len(),
            max_size: self.max_size,
            policy: self.policy,
            max_age_secs: self.max_age.num_seconds(),
            hits: self.hits,
            misses: self.misses,
            last_purge: self.last_purge,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(max_size: i64, policy: CachePolicy) -> EvictingStore<&'static str, u32> {
        EvictingStore::new(&CacheConfig {
            max_size,
            policy,
            max_age_secs: 60,
        })
    }

    #[test]
    fn test_lru_evicts_least_recently_hit() {
        let now = Utc::now();
        let mut s = store(2, CachePolicy::Lru);
        s.insert("a", 1, now);
        s.insert("b", 2, now);
        s.record_hit(&"a", now);
        s.insert("c", 3, now);

        assert!(s.get(&"a").is_some());
        assert!(s.get(&"b").is_none());
        assert!(s.get(&"c").is_some());
    }

    #[test]
    fn test_lfu_tie_breaks_on_oldest_insert() {
        let now = Utc::now();
        let mut s = store(2, CachePolicy::Lfu);
        s.insert("a", 1, now);
        s.insert("b", 2, now);
        s.insert("c", 3, now);

        assert!(s.get(&"a").is_none());
        assert_eq!(s.len(), 2);
    }

    #[test]
    fn test_replace_does_not_evict() {
        let now = Utc::now();
        let mut s = store(2, CachePolicy::Lru);
        s.insert("a", 1, now);
        s.insert("b", 2, now);
        s.insert("a", 10, now);

        assert_eq!(s.len(), 2);
        assert_eq!(s.get(&"a"), Some(&10));
    }

    #[test]
    fn test_disabled_store_ignores_inserts() {
        let mut s = store(DISABLED, CachePolicy::Lru);
        s.insert("a", 1, Utc::now());
        assert_eq!(s.len(), 0);
    }

    #[test]
    fn test_unbounded_store() {
        let now = Utc::now();
        let mut s: EvictingStore<u32, u32> = EvictingStore::new(&CacheConfig {
            max_size: -1,
            policy: CachePolicy::Lru,
            max_age_secs: 60,
        });
        for i in 0..100 {
            s.insert(i, i, now);
        }
        assert_eq!(s.len(), 100);
    }

    #[test]
    fn test_shrinking_evicts() {
        let now = Utc::now();
        let mut s = store(3, CachePolicy::Lru);
        s.insert("a", 1, now);
        s.insert("b", 2, now);
        s.insert("c", 3, now);
        s.set_max_size(1);

        assert_eq!(s.len(), 1);
        assert!(s.get(&"c").is_some());
    }

    #[test]
    fn test_record_hit_on_missing_key_counts_miss() {
        let mut s = store(2, CachePolicy::Lru);
        assert!(s.record_hit(&"x", Utc::now()).is_none());
        assert_eq!(s.stats().misses, 1);
        assert_eq!(s.stats().hits, 0);
    }
}
