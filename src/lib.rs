//! FlowRunner - Cooperative Workflow Execution Engine
//!
//! Runs parsed workflow documents as jobs made of many lightweight logical
//! threads, multiplexed over a small pool of OS worker threads. Built for
//! distributed test automation: jobs call remote services, raise and handle
//! named signals, and can be paused, stepped and inspected while they run.
//!
//! # Architecture
//!
//! The library is organized into these modules:
//!
//! - [`workflow`]: Actions, documents and the action registry
//! - [`execution`]: Jobs, logical threads, the worker pool and the engine
//! - [`script`]: The scripting contract and a named-value implementation
//! - [`cache`]: Document and machine-info caches (LRU/LFU)
//! - [`remote`]: Contract for the distributed command service
//! - [`monitoring`]: Execution timeline
//! - [`config`]: Engine configuration
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use flowrunner::{Engine, EngineConfig, JobRequest};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = Engine::new(EngineConfig::load("engine.yaml")?);
//!     let document = engine.load_local_document("smoke.yaml")?;
//!
//!     let job = engine.submit(JobRequest::new(document))?;
//!     job.wait(Duration::from_secs(300));
//!
//!     engine.shutdown();
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod execution;
pub mod monitoring;
pub mod remote;
pub mod script;
pub mod workflow;

// Re-export commonly used types
pub use cache::{CachePolicy, DocumentCache, MachineInfoCache};
pub use config::{CacheConfig, EngineConfig};
pub use error::{EngineError, Result};
pub use execution::{CompletionStatus, Engine, Job, JobRequest, LogicalThread};
pub use remote::RemoteCommandClient;
pub use workflow::{load_document, Action, ActionRegistry, Document, DocumentSpec};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "FlowRunner";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_version() {
        assert!(!VERSION.is_empty());
        assert!(VERSION.contains('.'));
    }

    #[test]
    fn test_app_name() {
        assert_eq!(APP_NAME, "FlowRunner");
    }

    #[test]
    fn test_module_exports_document() {
        let document = Document::new("smoke").with_default_function("main");
        assert_eq!(document.name(), "smoke");
        assert_eq!(document.default_function(), Some("main"));
    }

    #[test]
    fn test_module_exports_config() {
        let config = EngineConfig::default();
        assert_eq!(config.document_cache.policy, CachePolicy::Lru);
    }
}
