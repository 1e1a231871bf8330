//! Execution Engine
//!
//! The facade a service layer talks to. It owns:
//! - the worker pool shared by every job
//! - the registry of live jobs
//! - the document and machine-info caches
//! - the action registry used to build documents
//! - the optional remote command client
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use flowrunner::{Engine, EngineConfig, JobRequest};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = Engine::new(EngineConfig::default().with_workers(4));
//!     let document = engine.load_local_document("suite.yaml")?;
//!
//!     let job = engine.submit(JobRequest::new(document).with_function("main"))?;
//!     job.wait(Duration::from_secs(60));
//!     println!("{:?}", job.outcome());
//!
//!     engine.shutdown();
//!     Ok(())
//! }
//! ```

use std::fs;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, info};

use super::job::{Job, JobOptions};
use super::pool::WorkerPool;
use super::registry::JobRegistry;
use super::result::{CompletionStatus, JobDetail, ResultStore};
use crate::cache::{DocumentCache, MachineInfo, MachineInfoCache};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::remote::{RemoteCommandClient, SubmitMode, FILE_SEPARATOR_REQUEST, FS_SERVICE};
use crate::workflow::{load_document, ActionRegistry, Document};

/// Machine name used for documents read from the local file system.
pub const LOCAL_MACHINE: &str = "local";

/// A request to run a document.
#[derive(Clone)]
pub struct JobRequest {
    pub document: Arc<Document>,
    pub name: Option<String>,
    pub function: Option<String>,
    pub args: Option<String>,
    /// Validate and record a result without running anything.
    pub test_only: bool,
    pub break_on_first_function: bool,
    pub breakpoint_functions: Vec<String>,
    /// Overrides the engine-wide thread cap.
    pub max_threads: Option<usize>,
}

impl JobRequest {
    pub fn new(document: Arc<Document>) -> Self {
        Self {
            document,
            name: None,
            function: None,
            args: None,
            test_only: false,
            break_on_first_function: false,
            breakpoint_functions: Vec::new(),
            max_threads: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_function(mut self, function: impl Into<String>) -> Self {
        self.function = Some(function.into());
        self
    }

    pub fn with_args(mut self, args: impl Into<String>) -> Self {
        self.args = Some(args.into());
        self
    }

    pub fn test_only(mut self) -> Self {
        self.test_only = true;
        self
    }

    pub fn break_on_first_function(mut self) -> Self {
        self.break_on_first_function = true;
        self
    }

    pub fn with_breakpoint_function(mut self, function: impl Into<String>) -> Self {
        self.breakpoint_functions.push(function.into());
        self
    }

    pub fn with_max_threads(mut self, limit: usize) -> Self {
        self.max_threads = Some(limit);
        self
    }
}

/// Workflow execution engine.
pub struct Engine {
    config: EngineConfig,
    pool: Arc<WorkerPool>,
    registry: Arc<JobRegistry>,
    documents: DocumentCache,
    machines: MachineInfoCache,
    actions: ActionRegistry,
    remote: Option<Arc<dyn RemoteCommandClient>>,
    results: Option<ResultStore>,
}

impl Engine {
    /// Creates an engine and starts its worker pool.
    pub fn new(config: EngineConfig) -> Self {
        let pool = WorkerPool::new(config.worker_count());
        let results = config.result_dir.clone().map(ResultStore::new);
        info!(
            "Engine ready ({} workers, document cache {} {}, machine cache {} {})",
            pool.size(),
            config.document_cache.policy,
            config.document_cache.max_size,
            config.machine_cache.policy,
            config.machine_cache.max_size
        );

        Self {
            documents: DocumentCache::new(&config.document_cache),
            machines: MachineInfoCache::new(&config.machine_cache),
            pool,
            registry: JobRegistry::new(),
            actions: ActionRegistry::with_builtins(),
            remote: None,
            results,
            config,
        }
    }

    pub fn with_remote_client(mut self, client: Arc<dyn RemoteCommandClient>) -> Self {
        self.remote = Some(client);
        self
    }

    pub fn with_action_registry(mut self, actions: ActionRegistry) -> Self {
        self.actions = actions;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn actions(&self) -> &ActionRegistry {
        &self.actions
    }

    pub fn document_cache(&self) -> &DocumentCache {
        &self.documents
    }

    pub fn machine_cache(&self) -> &MachineInfoCache {
        &self.machines
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Creates, registers and starts a job.
    ///
    /// Configuration faults are returned here, before the job runs; the
    /// job still gets a persisted (abnormal) result.
    pub fn submit(&self, request: JobRequest) -> Result<Arc<Job>> {
        let id = self.registry.allocate_id();
        let options = JobOptions {
            name: request.name,
            start_function: request.function,
            args: request.args,
            max_threads: request.max_threads.or(self.config.max_threads_per_job),
            result_dir: self.config.result_dir.clone(),
            remote: self.remote.clone(),
            break_on_first_function: request.break_on_first_function,
            script: None,
        };
        let job = Job::new(id, request.document, Arc::clone(&self.pool), options);
        for function in request.breakpoint_functions {
            job.add_breakpoint_function(function);
        }
        self.registry.insert(&job);

        if request.test_only {
            return match job.validate() {
                Ok(function) => {
                    job.cleanup_pending_job(
                        CompletionStatus::Normal,
                        &format!("Test mode: '{}' validated, not run", function),
                    )?;
                    Ok(job)
                }
                Err(e) => {
                    job.cleanup_pending_job(CompletionStatus::Abnormal, &e.to_string())?;
                    Err(e)
                }
            };
        }

        if let Err(e) = job.start_execution() {
            job.cleanup_pending_job(CompletionStatus::Abnormal, &e.to_string())?;
            return Err(e);
        }
        Ok(job)
    }

    pub fn job(&self, id: u64) -> Result<Arc<Job>> {
        self.registry.get(id)
    }

    /// Ids of live jobs.
    pub fn job_ids(&self) -> Vec<u64> {
        self.registry.ids()
    }

    /// Returns a cached document, or fetches, caches and returns it.
    pub fn load_document<F>(
        &self,
        machine: &str,
        path: &str,
        mod_time: DateTime<Utc>,
        case_sensitive: bool,
        fetch: F,
    ) -> Result<Arc<Document>>
    where
        F: FnOnce() -> Result<Document>,
    {
        if let Some(document) = self.documents.lookup(machine, path, mod_time, case_sensitive) {
            return Ok(document);
        }

        debug!("Fetching document {} from {}", path, machine);
        let document = fetch().map_err(|e| EngineError::FetchFailed {
            machine: machine.to_string(),
            path: path.to_string(),
            message: e.to_string(),
        })?;
        let document = Arc::new(document);
        self.documents
            .add_document(machine, path, Arc::clone(&document), mod_time);
        Ok(document)
    }

    /// Loads a document spec from the local file system through the cache.
    pub fn load_local_document(&self, path: impl AsRef<Path>) -> Result<Arc<Document>> {
        let path = path.as_ref();
        let mod_time: DateTime<Utc> = fs::metadata(path)?.modified()?.into();
        let key = path.to_string_lossy();
        self.load_document(LOCAL_MACHINE, &key, mod_time, true, || {
            load_document(path, &self.actions)
        })
    }

    /// File separator of `machine`, from the cache or the remote service.
    pub fn file_separator(&self, machine: &str) -> Result<String> {
        if let Some(info) = self.machines.check_cache(machine) {
            return Ok(info.file_separator);
        }

        let client = self.remote.as_ref().ok_or_else(|| EngineError::FetchFailed {
            machine: machine.to_string(),
            path: FS_SERVICE.to_string(),
            message: "no remote command client configured".to_string(),
        })?;
        let reply = client.submit(machine, FS_SERVICE, FILE_SEPARATOR_REQUEST, SubmitMode::Synchronous)?;
        if !reply.is_ok() {
            return Err(EngineError::RemoteCommand {
                machine: machine.to_string(),
                service: FS_SERVICE.to_string(),
                code: reply.code,
                message: reply.payload,
            });
        }

        self.machines
            .add(machine, MachineInfo::new(reply.payload.clone()));
        Ok(reply.payload)
    }

    /// Persisted result of a job, live or not.
    pub fn load_result(&self, job_id: u64) -> Result<JobDetail> {
        if let Some(detail) = self.registry.get(job_id).ok().and_then(|job| job.detail()) {
            return Ok(detail);
        }
        match &self.results {
            Some(store) => store.load_detail(job_id),
            None => Err(EngineError::ResultNotFound(job_id)),
        }
    }

    /// Stops the worker pool after the work already queued.
    pub fn shutdown(&self) {
        info!("Shutting down engine ({} live jobs)", self.registry.len());
        self.pool.shutdown();
    }
}
