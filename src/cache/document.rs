//! Parsed Document Cache
//!
//! Entries are keyed by (machine, normalized path). Machine names always
//! compare case-insensitively; paths compare case-sensitively or not at
//! the caller's choice, since some file systems fold case and some do not.
//! An entry only counts as a hit while its stored modification time is at
//! least as new as the one the caller observed on the remote file.

use std::sync::Arc;

use chrono::{DateTime, Duration, SubsecRound, Utc};
use log::{debug, info};
use parking_lot::Mutex;
use serde::Serialize;

use super::store::EvictingStore;
use super::{CachePolicy, CacheStats};
use crate::config::CacheConfig;
use crate::workflow::Document;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DocumentKey {
    machine: String,
    path: String,
}

impl DocumentKey {
    fn new(machine: &str, path: &str) -> Self {
        Self {
            machine: machine.to_lowercase(),
            path: normalize_path(path),
        }
    }

    fn matches(&self, other: &DocumentKey, case_sensitive: bool) -> bool {
        if self.machine != other.machine {
            return false;
        }
        if case_sensitive {
            self.path == other.path
        } else {
            self.path.to_lowercase() == other.path.to_lowercase()
        }
    }
}

#[derive(Debug, Clone)]
struct CachedDocument {
    document: Arc<Document>,
    mod_time: DateTime<Utc>,
}

/// Introspection row for one cached document.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct DocumentCacheEntry {
    pub machine: String,
    pub path: String,
    pub document: String,
    pub mod_time: DateTime<Utc>,
    pub hits: u64,
    pub added: DateTime<Utc>,
    pub last_hit: Option<DateTime<Utc>>,
}

/// Normalizes a document path for use as a cache key.
///
/// Backslashes become slashes, empty and `.` components are dropped, and
/// `..` removes the preceding component.
pub fn normalize_path(path: &str) -> String {
    let unified = path.replace('\\', "/");
    let absolute = unified.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();

    for part in unified.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }

    let joined = parts.join("/");
    if absolute {
        format!("/{}", joined)
    } else {
        joined
    }
}

/// Cache of parsed workflow documents shared by every job in the engine.
pub struct DocumentCache {
    store: Mutex<EvictingStore<DocumentKey, CachedDocument>>,
}

impl DocumentCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            store: Mutex::new(EvictingStore::new(config)),
        }
    }

    /// Reports whether a current copy of the document is cached, counting
    /// the lookup as a hit or a miss.
    pub fn check_cache(
        &self,
        machine: &str,
        path: &str,
        mod_time: DateTime<Utc>,
        case_sensitive: bool,
    ) -> bool {
        self.lookup_at(machine, path, mod_time, case_sensitive, Utc::now())
            .is_some()
    }

    pub fn check_cache_at(
        &self,
        machine: &str,
        path: &str,
        mod_time: DateTime<Utc>,
        case_sensitive: bool,
        now: DateTime<Utc>,
    ) -> bool {
        self.lookup_at(machine, path, mod_time, case_sensitive, now)
            .is_some()
    }

    /// Returns the cached document without touching any counter.
    pub fn get_document(
        &self,
        machine: &str,
        path: &str,
        case_sensitive: bool,
    ) -> Option<Arc<Document>> {
        let wanted = DocumentKey::new(machine, path);
        let store = self.store.lock();
        let key = store.find(|key, _| key.matches(&wanted, case_sensitive))?;
        store.get(&key).map(|cached| Arc::clone(&cached.document))
    }

    /// Checks and fetches in one step under a single lock.
    pub fn lookup(
        &self,
        machine: &str,
        path: &str,
        mod_time: DateTime<Utc>,
        case_sensitive: bool,
    ) -> Option<Arc<Document>> {
        self.lookup_at(machine, path, mod_time, case_sensitive, Utc::now())
    }

    pub fn lookup_at(
        &self,
        machine: &str,
        path: &str,
        mod_time: DateTime<Utc>,
        case_sensitive: bool,
        now: DateTime<Utc>,
    ) -> Option<Arc<Document>> {
        let wanted = DocumentKey::new(machine, path);
        let known = mod_time.trunc_subsecs(0);
        let mut store = self.store.lock();

        if !store.is_enabled() {
            store.record_miss();
            return None;
        }
        store.expire(now);

        let key = store.find(|key, cached| {
            key.matches(&wanted, case_sensitive) && cached.mod_time >= known
        });
        match key {
            Some(key) => {
                debug!("Document cache hit for {}:{}", wanted.machine, wanted.path);
                store
                    .record_hit(&key, now)
                    .map(|cached| Arc::clone(&cached.document))
            }
            None => {
                debug!("Document cache miss for {}:{}", wanted.machine, wanted.path);
                store.record_miss();
                None
            }
        }
    }

    /// Caches a freshly parsed document, evicting first if at capacity.
    pub fn add_document(
        &self,
        machine: &str,
        path: &str,
        document: Arc<Document>,
        mod_time: DateTime<Utc>,
    ) {
        self.add_document_at(machine, path, document, mod_time, Utc::now());
    }

    pub fn add_document_at(
        &self,
        machine: &str,
        path: &str,
        document: Arc<Document>,
        mod_time: DateTime<Utc>,
        now: DateTime<Utc>,
    ) {
        let key = DocumentKey::new(machine, path);
        let cached = CachedDocument {
            document,
            mod_time: mod_time.trunc_subsecs(0),
        };
        self.store.lock().insert(key, cached, now);
    }

    /// Removes every entry; returns how many were removed.
    pub fn purge(&self) -> usize {
        let purged = self.store.lock().purge(Utc::now());
        info!("Purged {} documents from the document cache", purged);
        purged
    }

    /// `-1` removes the bound, `0` disables caching.
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

    /// Cached documents, most hit first.
    pub fn entries(&self) -> Vec<DocumentCacheEntry> {
        let store = self.store.lock();
        let mut rows: Vec<DocumentCacheEntry> = store
            .entries()
            .map(|(key, entry)| DocumentCacheEntry {
                machine: key.machine.clone(),
                path: key.path.clone(),
                document: entry.value.document.name().to_string(),
                mod_time: entry.value.mod_time,
                hits: entry.hits,
                added: entry.added,
                last_hit: entry.last_hit,
            })
            .collect();
        rows.sort_by(|a, b| b.hits.cmp(&a.hits).then_with(|| a.path.cmp(&b.path)));
        rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{DISABLED, UNBOUNDED};

    fn cache(max_size: i64, policy: CachePolicy) -> DocumentCache {
        DocumentCache::new(
            &CacheConfig::default()
                .with_max_size(max_size)
                .with_policy(policy)
                .with_max_age_secs(60),
        )
    }

    fn doc(name: &str) -> Arc<Document> {
        Arc::new(Document::new(name))
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("/tmp/./a//b.xml"), "/tmp/a/b.xml");
        assert_eq!(normalize_path("C:\\tests\\suite.xml"), "C:/tests/suite.xml");
        assert_eq!(normalize_path("/tmp/x/../y.xml"), "/tmp/y.xml");
        assert_eq!(normalize_path("rel/./doc.xml"), "rel/doc.xml");
    }

    #[test]
    fn test_lru_capacity_two() {
        let cache = cache(2, CachePolicy::Lru);
        let t = Utc::now();
        cache.add_document("m", "/a.xml", doc("A"), t);
        cache.add_document("m", "/b.xml", doc("B"), t);
        assert!(cache.check_cache("m", "/a.xml", t, true));
        cache.add_document("m", "/c.xml", doc("C"), t);

        assert!(cache.get_document("m", "/a.xml", true).is_some());
        assert!(cache.get_document("m", "/b.xml", true).is_none());
        assert!(cache.get_document("m", "/c.xml", true).is_some());
    }

    #[test]
    fn test_lfu_entry_expires_after_max_age() {
        let cache = cache(UNBOUNDED, CachePolicy::Lfu);
        let added = Utc::now();
        cache.add_document_at("m", "/a.xml", doc("A"), added, added);

        let later = added + Duration::seconds(30);
        assert!(cache.lookup_at("m", "/a.xml", added, true, later).is_some());

        let expired = added + Duration::seconds(61);
        assert!(cache.lookup_at("m", "/a.xml", added, true, expired).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_lru_does_not_expire_by_age() {
        let cache = cache(UNBOUNDED, CachePolicy::Lru);
        let added = Utc::now();
        cache.add_document_at("m", "/a.xml", doc("A"), added, added);
        let much_later = added + Duration::days(30);
        assert!(cache.check_cache_at("m", "/a.xml", added, true, much_later));
    }

    #[test]
    fn test_case_sensitivity() {
        let cache = cache(5, CachePolicy::Lru);
        let t = Utc::now();
        cache.add_document("Lab1", "/tmp/foo.xml", doc("foo"), t);

        assert!(cache.check_cache("lab1", "/tmp/Foo.xml", t, false));
        assert!(!cache.check_cache("lab1", "/tmp/Foo.xml", t, true));
        assert!(cache.check_cache("LAB1", "/tmp/foo.xml", t, true));
    }

    #[test]
    fn test_stale_mod_time_misses() {
        let cache = cache(5, CachePolicy::Lru);
        let t = Utc::now();
        cache.add_document("m", "/a.xml", doc("A"), t);

        assert!(!cache.check_cache("m", "/a.xml", t + Duration::seconds(5), true));
        assert!(cache.check_cache("m", "/a.xml", t - Duration::seconds(5), true));
    }

    #[test]
    fn test_mod_time_truncated_to_second() {
        let cache = cache(5, CachePolicy::Lru);
        let t = Utc::now().trunc_subsecs(0) + Duration::milliseconds(900);
        cache.add_document("m", "/a.xml", doc("A"), t.trunc_subsecs(0));
        assert!(cache.check_cache("m", "/a.xml", t, true));
    }

    #[test]
    fn test_purge_keeps_counters() {
        let cache = cache(UNBOUNDED, CachePolicy::Lru);
        let t = Utc::now();
        for i in 0..10 {
            cache.add_document("m", &format!("/doc{}.xml", i), doc("d"), t);
        }
        assert!(cache.check_cache("m", "/doc3.xml", t, true));
        assert!(!cache.check_cache("m", "/missing.xml", t, true));

        assert_eq!(cache.purge(), 10);
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));
        assert!(stats.last_purge.is_some());

        assert!(!cache.check_cache("m", "/doc3.xml", t, true));
        assert_eq!(cache.stats().misses, 2);
    }

    #[test]
    fn test_disabled_cache_always_misses() {
        let cache = cache(5, CachePolicy::Lru);
        let t = Utc::now();
        cache.add_document("m", "/a.xml", doc("A"), t);
        cache.set_max_cache_size(DISABLED);

        assert!(cache.is_empty());
        cache.add_document("m", "/a.xml", doc("A"), t);
        assert!(!cache.check_cache("m", "/a.xml", t, true));
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn test_get_document_is_pure() {
        let cache = cache(5, CachePolicy::Lru);
        let t = Utc::now();
        cache.add_document("m", "/a.xml", doc("A"), t);
        assert!(cache.get_document("m", "/a.xml", true).is_some());
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses), (0, 0));
    }

    #[test]
    fn test_entries_listing() {
        let cache = cache(5, CachePolicy::Lfu);
        let t = Utc::now();
        cache.add_document("m", "/a.xml", doc("A"), t);
        cache.add_document("m", "/b.xml", doc("B"), t);
        cache.check_cache("m", "/b.xml", t, true);

        let rows = cache.entries();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].document, "B");
        assert_eq!(rows[0].hits, 1);
    }
}
