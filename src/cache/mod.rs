//! Remote Resource Caches
//!
//! Keeps the engine from re-fetching and re-parsing workflow documents and
//! from repeating machine-metadata lookups while many jobs run at once.
//!
//! # Components
//!
//! - [`DocumentCache`]: parsed documents keyed by machine and path
//! - [`MachineInfoCache`]: per-machine metadata (file separator)
//!
//! Both caches share one eviction core: a bounded map with LRU or LFU
//! eviction, LFU age expiry, and lifetime hit/miss counters that survive
//! purges.

pub mod document;
pub mod machine;
mod store;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use document::{normalize_path, DocumentCache};
pub use machine::{MachineInfo, MachineInfoCache};

/// Capacity value meaning "no bound".
pub const UNBOUNDED: i64 = -1;

/// Capacity value meaning "caching disabled".
pub const DISABLED: i64 = 0;

/// Eviction policy applied when a cache is full.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CachePolicy {
    /// Evict the least recently hit entry.
    #[default]
    Lru,
    /// Evict the least frequently hit entry; also expire entries past the
    /// maximum age.
    Lfu,
}

impl fmt::Display for CachePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CachePolicy::Lru => write!(f, "LRU"),
            CachePolicy::Lfu => write!(f, "LFU"),
        }
    }
}

/// Point-in-time view of a cache's counters and settings.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct CacheStats {
    pub size: usize,
    pub max_size: i64,
    pub policy: CachePolicy,
    pub max_age_secs: i64,
    pub hits: u64,
    pub misses: u64,
    pub last_purge: Option<DateTime<Utc>>,
}

impl CacheStats {
    /// Fraction of lookups that hit, or 0.0 before the first lookup.
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(hits: u64, misses: u64) -> CacheStats {
        CacheStats {
            size: 0,
            max_size: 20,
            policy: CachePolicy::Lru,
            max_age_secs: 60,
            hits,
            misses,
            last_purge: None,
        }
    }

    #[test]
    fn test_hit_ratio() {
        assert_eq!(stats(0, 0).hit_ratio(), 0.0);
        assert!((stats(3, 1).hit_ratio() - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn test_policy_serde() {
        let policy: CachePolicy = serde_yaml::from_str("lfu").unwrap();
        assert_eq!(policy, CachePolicy::Lfu);
        assert_eq!(CachePolicy::default(), CachePolicy::Lru);
        assert_eq!(CachePolicy::Lfu.to_string(), "LFU");
    }
}
