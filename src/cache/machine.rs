//! Machine Metadata Cache
//!
//! Remembers per-machine facts (currently the file separator) so that
//! path handling does not cost a remote round trip for every document.

use chrono::{DateTime, Duration, Utc};
use log::info;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::store::EvictingStore;
use super::{CachePolicy, CacheStats};
use crate::config::CacheConfig;

/// Metadata cached per machine.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct MachineInfo {
    pub file_separator: String,
}

impl MachineInfo {
    pub fn new(file_separator: impl Into<String>) -> Self {
        Self {
            file_separator: file_separator.into(),
        }
    }
}

/// Machine alias to [`MachineInfo`] cache. Aliases compare case-insensitively.
pub struct MachineInfoCache {
    store: Mutex<EvictingStore<String, MachineInfo>>,
}

impl MachineInfoCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            store: Mutex::new(EvictingStore::new(config)),
        }
    }

    /// Looks `machine` up, counting a hit or a miss.
    pub fn check_cache(&self, machine: &str) -> Option<MachineInfo> {
        self.check_cache_at(machine, Utc::now())
    }

    pub fn check_cache_at(&self, machine: &str, now: DateTime<Utc>) -> Option<MachineInfo> {
        let key = machine.to_lowercase();
        let mut store = self.store.lock();
        if !store.is_enabled() {
            store.record_miss();
            return None;
        }
        store.expire(now);
        store.record_hit(&key, now).cloned()
    }

    /// Returns the cached metadata without touching any counter.
    pub fn get(&self, machine: &str) -> Option<MachineInfo> {
        self.store.lock().get(&machine.to_lowercase()).cloned()
    }

    pub fn add(&self, machine: &str, info: MachineInfo) {
        self.add_at(machine, info, Utc::now());
    }

    pub fn add_at(&self, machine: &str, info: MachineInfo, now: DateTime<Utc>) {
        self.store.lock().insert(machine.to_lowercase(), info, now);
    }

    pub fn purge(&self) -> usize {
        let purged = self.store.lock().purge(Utc::now());
        info!("Purged {} machines from the machine info cache", purged);
        purged
    }

    pub fn set_max_cache_size(&self, max_size: i64) {
        self.store.lock().set_max_size(max_size);
    }

    pub fn set_policy(&self, policy: CachePolicy) {
        self.store.lock().set_policy(policy);
    }

    pub fn set_max_age(&self, max_age_secs: i64) {
        self.store.lock().set_max_age(Duration::seconds(max_age_secs));
    }

    pub fn len(&self) -> usize {
        self.store.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        self.store.lock().stats()
    }

    /// Cached machines in alias order with their hit counts.
    pub fn entries(&self) -> Vec<(String, MachineInfo, u64)> {
        let store = self.store.lock();
        let mut rows: Vec<_> = store
            .entries()
            .map(|(machine, entry)| (machine.clone(), entry.value.clone(), entry.hits))
            .collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(max_size: i64, policy: CachePolicy) -> MachineInfoCache {
        MachineInfoCache::new(
            &CacheConfig::default()
                .with_max_size(max_size)
                .with_policy(policy)
                .with_max_age_secs(60),
        )
    }

    #[test]
    fn test_case_insensitive_alias() {
        let cache = cache(5, CachePolicy::Lru);
        cache.add("Lab1.example.com", MachineInfo::new("/"));

        assert_eq!(
            cache.check_cache("LAB1.EXAMPLE.COM"),
            Some(MachineInfo::new("/"))
        );
        assert!(cache.check_cache("lab2").is_none());

        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));
    }

    #[test]
    fn test_lfu_keeps_frequently_hit() {
        let cache = cache(2, CachePolicy::Lfu);
        cache.add("win", MachineInfo::new("\\"));
        cache.add("unix", MachineInfo::new("/"));
        cache.check_cache("win");
        cache.check_cache("win");
        cache.check_cache("unix");
        cache.add("mac", MachineInfo::new("/"));

        assert!(cache.get("win").is_some());
        assert!(cache.get("unix").is_none());
        assert!(cache.get("mac").is_some());
    }

    #[test]
    fn test_lfu_expiry() {
        let cache = cache(-1, CachePolicy::Lfu);
        let added = Utc::now();
        cache.add_at("lab1", MachineInfo::new("/"), added);
        assert!(cache
            .check_cache_at("lab1", added + Duration::seconds(61))
            .is_none());
    }

    #[test]
    fn test_purge() {
        let cache = cache(-1, CachePolicy::Lru);
        for i in 0..4 {
            cache.add(&format!("m{}", i), MachineInfo::new("/"));
        }
        assert_eq!(cache.purge(), 4);
        assert!(cache.is_empty());
        assert_eq!(cache.entries().len(), 0);
    }
}
