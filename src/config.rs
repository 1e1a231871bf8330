//! Engine Configuration
//!
//! Settings for the worker pool, per-job thread limits, result
//! persistence and the two resource caches. Loadable from YAML:
//!
//! ```yaml
//! workers: 8
//! max_threads_per_job: 500
//! result_dir: /var/lib/flowrunner/results
//! document_cache:
//!   max_size: 50
//!   policy: lfu
//!   max_age_secs: 3600
//! machine_cache:
//!   max_size: -1
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use log::info;
use serde::{Deserialize, Serialize};

use crate::cache::CachePolicy;
use crate::error::Result;

/// Default number of physical workers.
pub const DEFAULT_WORKERS: usize = 5;

/// Smallest worker pool the engine will run with.
pub const MIN_WORKERS: usize = 2;

/// Default capacity of each cache.
pub const DEFAULT_CACHE_SIZE: i64 = 20;

/// Default LFU maximum entry age (one day).
pub const DEFAULT_MAX_AGE_SECS: i64 = 24 * 60 * 60;

/// Settings for one eviction cache.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// Capacity; -1 is unbounded and 0 disables caching.
    pub max_size: i64,
    /// Eviction policy.
    pub policy: CachePolicy,
    /// Maximum entry age in seconds (LFU only).
    pub max_age_secs: i64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_CACHE_SIZE,
            policy: CachePolicy::Lru,
            max_age_secs: DEFAULT_MAX_AGE_SECS,
        }
    }
}

impl CacheConfig {
    /// Sets the capacity.
    pub fn with_max_size(mut self, max_size: i64) -> Self {
        self.max_size = max_size;
        self
    }

    /// Sets the eviction policy.
    pub fn with_policy(mut self, policy: CachePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Sets the LFU maximum age.
    pub fn with_max_age_secs(mut self, secs: i64) -> Self {
        self.max_age_secs = secs;
        self
    }
}

/// Top-level engine configuration.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Physical worker count; 0 sizes the pool from the CPU count.
    pub workers: usize,
    /// Limit on concurrently live child threads per job.
    pub max_threads_per_job: Option<usize>,
    /// Directory receiving result snapshots; nothing is persisted if unset.
    pub result_dir: Option<PathBuf>,
    pub document_cache: CacheConfig,
    pub machine_cache: CacheConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            max_threads_per_job: None,
            result_dir: None,
            document_cache: CacheConfig::default(),
            machine_cache: CacheConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a configuration from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let config = Self::from_yaml(&content)?;
        info!("Loaded engine configuration from {}", path.display());
        Ok(config)
    }

    /// Parses a configuration from YAML text.
    pub fn from_yaml(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Sets the worker count.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Sets the per-job child thread limit.
    pub fn with_max_threads_per_job(mut self, limit: usize) -> Self {
        self.max_threads_per_job = Some(limit);
        self
    }

    /// Sets the result snapshot directory.
    pub fn with_result_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.result_dir = Some(dir.into());
        self
    }

    /// Sets the document cache settings.
    pub fn with_document_cache(mut self, cache: CacheConfig) -> Self {
        self.document_cache = cache;
        self
    }

    /// Sets the machine-info cache settings.
    pub fn with_machine_cache(mut self, cache: CacheConfig) -> Self {
        self.machine_cache = cache;
        self
    }

    /// Effective worker count after applying the auto-size rule and floor.
    pub fn worker_count(&self) -> usize {
        let requested = if self.workers == 0 {
            num_cpus::get()
        } else {
            self.workers
        };
        requested.max(MIN_WORKERS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.worker_count(), DEFAULT_WORKERS);
        assert!(config.max_threads_per_job.is_none());
        assert_eq!(config.document_cache.max_size, DEFAULT_CACHE_SIZE);
        assert_eq!(config.document_cache.policy, CachePolicy::Lru);
    }

    #[test]
    fn test_worker_floor() {
        assert_eq!(EngineConfig::new().with_workers(1).worker_count(), MIN_WORKERS);
        assert!(EngineConfig::new().with_workers(0).worker_count() >= MIN_WORKERS);
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let config = EngineConfig::from_yaml(
            "workers: 8\ndocument_cache:\n  policy: lfu\n  max_age_secs: 60\n",
        )
        .unwrap();

        assert_eq!(config.workers, 8);
        assert_eq!(config.document_cache.policy, CachePolicy::Lfu);
        assert_eq!(config.document_cache.max_age_secs, 60);
        assert_eq!(config.document_cache.max_size, DEFAULT_CACHE_SIZE);
        assert_eq!(config.machine_cache, CacheConfig::default());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("engine.yaml");
        fs::write(&path, "max_threads_per_job: 3\nmachine_cache:\n  max_size: -1\n").unwrap();

        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.max_threads_per_job, Some(3));
        assert_eq!(config.machine_cache.max_size, -1);
    }

    #[test]
    fn test_invalid_yaml() {
        assert!(EngineConfig::from_yaml("workers: [oops").is_err());
    }

    #[test]
    fn test_load_missing_file() {
        assert!(EngineConfig::load("/nonexistent/engine.yaml").is_err());
    }
}
