//! Jobs
//!
//! A job is one execution of a document. It owns every logical thread of
//! that execution in a table keyed by thread id, assembles the result when
//! the last thread completes, and notifies its completion listeners
//! exactly once.
//!
//! Threads refer to each other only by id; the job is the single owner.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use log::{debug, error, info, log, warn, Level};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};

use super::breakpoint::{Breakpoint, BreakpointTable};
use super::condition::{Condition, ConditionKind};
use super::pool::WorkerPool;
use super::registry::JobRegistry;
use super::result::{
    CompletionStatus, JobDetail, JobLogEntry, JobOutcome, JobSummary, ResultStore,
    TestcaseOutcome,
};
use super::signals::{default_policies, DefaultSignalHandler};
use super::thread::{LogicalThread, ThreadSeed, ThreadSnapshot};
use crate::error::{EngineError, Result};
use crate::monitoring::{EventType, ExecutionTimeline};
use crate::remote::{CommandHandle, RemoteCommandClient};
use crate::script::{
    CompileMode, ScriptContext, VariableContext, JOB_ID_VAR, JOB_NAME_VAR, START_FUNCTION_VAR,
};
use crate::workflow::{Action, CallAction, Document};

/// Id of the thread every job is created with.
pub const ROOT_THREAD_ID: u64 = 1;

/// Interval of the bounded completion poll in [`Job::wait`].
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Job lifecycle state. A job moves from Pending to Running at most once.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Running,
}

/// Called once with the final result when the job completes.
pub type JobListener = Box<dyn FnOnce(&JobDetail) + Send>;

/// Per-job settings fixed at creation.
#[derive(Clone, Default)]
pub struct JobOptions {
    pub name: Option<String>,
    /// Function to start; the document's default when `None`.
    pub start_function: Option<String>,
    /// Argument expression for the start function.
    pub args: Option<String>,
    /// Cap on concurrently live child threads.
    pub max_threads: Option<usize>,
    pub result_dir: Option<PathBuf>,
    pub remote: Option<Arc<dyn RemoteCommandClient>>,
    pub break_on_first_function: bool,
    /// Script context of the root thread; a fresh one when `None`.
    pub script: Option<Arc<dyn ScriptContext>>,
}

struct JobInner {
    state: JobState,
    outcome: JobOutcome,
    result: Value,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    log: Vec<JobLogEntry>,
    testcases: BTreeMap<String, TestcaseOutcome>,
    detail: Option<JobDetail>,
    command_handle: Option<CommandHandle>,
}

/// One execution of a document.
pub struct Job {
    id: u64,
    name: String,
    document: Arc<Document>,
    options: JobOptions,
    pool: Arc<WorkerPool>,
    results: Option<ResultStore>,
    threads: Mutex<BTreeMap<u64, Arc<LogicalThread>>>,
    next_thread_id: AtomicU64,
    breakpoints: Mutex<BreakpointTable>,
    break_on_first_function: AtomicBool,
    /// Set between `hold` and `release`; read under the `threads` lock.
    held: AtomicBool,
    listeners: Mutex<Vec<JobListener>>,
    timeline: Mutex<ExecutionTimeline>,
    inner: Mutex<JobInner>,
    registry: OnceCell<Weak<JobRegistry>>,
    finishing: AtomicBool,
    completed: AtomicBool,
}

impl Job {
    /// Creates a pending job with its root thread.
    pub fn new(
        id: u64,
        document: Arc<Document>,
        pool: Arc<WorkerPool>,
        options: JobOptions,
    ) -> Arc<Self> {
        let name = options
            .name
            .clone()
            .unwrap_or_else(|| document.name().to_string());
        let results = options.result_dir.clone().map(ResultStore::new);
        let script = options
            .script
            .clone()
            .unwrap_or_else(VariableContext::shared);

        Arc::new_cyclic(|me: &Weak<Job>| {
            let root = LogicalThread::new(
                ROOT_THREAD_ID,
                id,
                me.clone(),
                ThreadSeed {
                    parent: None,
                    lineage: Vec::new(),
                    script,
                    handlers: Default::default(),
                    step_armed: false,
                },
            );

            Self {
                id,
                name,
                document,
                break_on_first_function: AtomicBool::new(options.break_on_first_function),
                options,
                pool,
                results,
                threads: Mutex::new(BTreeMap::from([(ROOT_THREAD_ID, root)])),
                next_thread_id: AtomicU64::new(ROOT_THREAD_ID + 1),
                breakpoints: Mutex::new(BreakpointTable::new()),
                held: AtomicBool::new(false),
                listeners: Mutex::new(Vec::new()),
                timeline: Mutex::new(ExecutionTimeline::new()),
                inner: Mutex::new(JobInner {
                    state: JobState::Pending,
                    outcome: JobOutcome::default(),
                    result: Value::Null,
                    started_at: None,
                    ended_at: None,
                    log: Vec::new(),
                    testcases: BTreeMap::new(),
                    detail: None,
                    command_handle: None,
                }),
                registry: OnceCell::new(),
                finishing: AtomicBool::new(false),
                completed: AtomicBool::new(false),
            }
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn document(&self) -> &Arc<Document> {
        &self.document
    }

    pub fn state(&self) -> JobState {
        self.inner.lock().state
    }

    pub fn is_complete(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    pub fn outcome(&self) -> JobOutcome {
        self.inner.lock().outcome.clone()
    }

    pub fn result(&self) -> Value {
        self.inner.lock().result.clone()
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.inner.lock().started_at
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.inner.lock().ended_at
    }

    /// Final result, once the job has completed.
    pub fn detail(&self) -> Option<JobDetail> {
        self.inner.lock().detail.clone()
    }

    pub(crate) fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn remote_client(&self) -> Option<Arc<dyn RemoteCommandClient>> {
        self.options.remote.clone()
    }

    pub(crate) fn attach_registry(&self, registry: Weak<JobRegistry>) {
        if self.registry.set(registry).is_err() {
            warn!("Job {} is already registered", self.id);
        }
    }

    /// Resolves the start function without starting anything.
    pub fn validate(&self) -> Result<String> {
        let function = match &self.options.start_function {
            Some(function) => function.clone(),
            None => self
                .document
                .default_function()
                .map(str::to_string)
                .ok_or(EngineError::MissingStartFunction)?,
        };
        if !self.document.has_function(&function) {
            return Err(EngineError::InvalidStartFunction(function));
        }
        Ok(function)
    }

    /// Starts the root thread on the start function.
    pub fn start_execution(&self) -> Result<()> {
        let function = self.validate()?;
        {
            let mut inner = self.inner.lock();
            if inner.state != JobState::Pending || self.finishing.load(Ordering::Acquire) {
                return Err(EngineError::AlreadyStarted(self.id));
            }
            inner.state = JobState::Running;
            inner.started_at = Some(Utc::now());
        }

        let root = self.thread(ROOT_THREAD_ID)?;
        let script = root.script();
        script.set(JOB_ID_VAR, json!(self.id));
        script.set(JOB_NAME_VAR, json!(self.name));
        script.set(START_FUNCTION_VAR, json!(function));

        for (signal, policy) in default_policies() {
            root.set_signal_handler(signal, Arc::new(DefaultSignalHandler::new(signal, policy)));
        }

        let mut call = CallAction::new(function.clone());
        if let Some(args) = &self.options.args {
            call = call.with_args(args.clone());
        }
        root.push_action(Box::new(call));
        if let Some(declarations) = self.document.root() {
            root.push_action(declarations.clone_action());
        }

        if let Some(client) = &self.options.remote {
            match client.register_handle(&format!("job-{}", self.id)) {
                Ok(handle) => self.inner.lock().command_handle = Some(handle),
                Err(e) => warn!("Job {} could not register a command handle: {}", self.id, e),
            }
        }

        info!("Job {} ({}) started at function '{}'", self.id, self.name, function);
        self.record_event("job".to_string(), EventType::JobStarted, None);
        root.schedule();
        Ok(())
    }

    /// Completes a job that never started running, e.g. one that failed
    /// validation or was submitted in test mode.
    pub fn cleanup_pending_job(&self, status: CompletionStatus, reason: &str) -> Result<()> {
        if self.state() != JobState::Pending || self.finishing.load(Ordering::Acquire) {
            return Err(EngineError::AlreadyStarted(self.id));
        }
        match status {
            CompletionStatus::Normal => self.log(Level::Info, reason),
            _ => self.log_error(reason),
        }
        self.escalate(status, None, reason);
        self.threads.lock().clear();
        self.finish();
        Ok(())
    }

    /// Registers `listener` for the job's completion. A listener added
    /// after completion is called immediately.
    pub fn add_completion_listener(&self, listener: JobListener) {
        let mut listeners = self.listeners.lock();
        // finish() stores the detail before draining, so checking under
        // the listener lock cannot miss it.
        match self.detail() {
            Some(detail) => {
                drop(listeners);
                listener(&detail);
            }
            None => listeners.push(listener),
        }
    }

    /// Polls until the job completes or `timeout` elapses.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while !self.is_complete() {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(WAIT_POLL_INTERVAL);
        }
        true
    }

    pub fn thread(&self, id: u64) -> Result<Arc<LogicalThread>> {
        self.threads
            .lock()
            .get(&id)
            .cloned()
            .ok_or(EngineError::ThreadNotFound {
                job: self.id,
                thread: id,
            })
    }

    /// Live threads in id order.
    pub fn threads(&self) -> Vec<Arc<LogicalThread>> {
        self.threads.lock().values().cloned().collect()
    }

    pub fn thread_count(&self) -> usize {
        self.threads.lock().len()
    }

    pub fn snapshots(&self) -> Vec<ThreadSnapshot> {
        self.threads().iter().map(|t| t.snapshot()).collect()
    }

    /// Allocates an id and registers a new thread, enforcing the cap on
    /// live child threads.
    pub(crate) fn add_thread(self: &Arc<Self>, seed: ThreadSeed) -> Result<Arc<LogicalThread>> {
        let mut threads = self.threads.lock();
        if let Some(limit) = self.options.max_threads {
            let children = threads.keys().filter(|id| **id != ROOT_THREAD_ID).count();
            if children >= limit {
                return Err(EngineError::ThreadLimitExceeded { job: self.id, limit });
            }
        }
        let id = self.next_thread_id.fetch_add(1, Ordering::Relaxed);
        let thread = LogicalThread::new(id, self.id, Arc::downgrade(self), seed);
        if self.held.load(Ordering::SeqCst) {
            thread.add_condition(Condition::hard_hold());
        }
        threads.insert(id, Arc::clone(&thread));
        Ok(thread)
    }

    /// Deregisters a completed thread; the last one completes the job.
    pub(crate) fn remove_thread(&self, id: u64) {
        let empty = {
            let mut threads = self.threads.lock();
            if threads.remove(&id).is_none() {
                warn!("Job {} has no thread {} to remove", self.id, id);
                return;
            }
            threads.is_empty()
        };
        if empty {
            self.finish();
        }
    }

    fn finish(&self) {
        if self.finishing.swap(true, Ordering::AcqRel) {
            return;
        }
        let ended_at = Utc::now();
        self.record_event("job".to_string(), EventType::JobEnded, None);

        let detail = {
            let mut inner = self.inner.lock();
            inner.ended_at = Some(ended_at);
            let summary = JobSummary {
                job_id: self.id,
                job_name: self.name.clone(),
                document: self.document.name().to_string(),
                start_function: self
                    .options
                    .start_function
                    .clone()
                    .or_else(|| self.document.default_function().map(str::to_string)),
                status: inner.outcome.status,
                termination_code: inner.outcome.termination_code,
                reason: inner.outcome.reason.clone(),
                result: inner.result.clone(),
                started_at: inner.started_at,
                ended_at,
                errors: inner.log.iter().filter(|e| e.is_error()).cloned().collect(),
            };
            let detail = JobDetail {
                summary,
                testcases: inner.testcases.values().cloned().collect(),
            };
            inner.detail = Some(detail.clone());
            detail
        };

        if let Some(store) = &self.results {
            if let Err(e) = store.save(&detail) {
                error!("Failed to save results of job {}: {}", self.id, e);
            }
        }

        info!(
            "Job {} ({}) completed: {}",
            self.id, self.name, detail.summary.status
        );

        let listeners = std::mem::take(&mut *self.listeners.lock());
        for listener in listeners {
            listener(&detail);
        }

        let handle = self.inner.lock().command_handle.take();
        if let (Some(client), Some(handle)) = (&self.options.remote, handle) {
            if let Err(e) = client.release_handle(&handle) {
                warn!("Job {} could not release its command handle: {}", self.id, e);
            }
        }

        if let Some(registry) = self.registry.get().and_then(Weak::upgrade) {
            registry.remove(self.id);
        }
        self.completed.store(true, Ordering::Release);
    }

    /// Records the job's return value. Called when the root thread ends.
    pub(crate) fn capture_result(&self, value: Value) {
        self.inner.lock().result = value;
    }

    /// Records a non-normal verdict unless one is already recorded.
    pub fn escalate(&self, status: CompletionStatus, code: Option<i64>, reason: impl Into<String>) {
        let reason = reason.into();
        if self.inner.lock().outcome.escalate(status, code, reason.clone()) {
            debug!("Job {} marked {}: {}", self.id, status, reason);
        }
    }

    /// Terminates every thread of the job, lifting any job-wide hold.
    pub fn terminate(&self, code: i64) {
        info!("Terminating job {} with code {}", self.id, code);
        self.escalate(
            CompletionStatus::Terminated,
            Some(code),
            format!("Terminated with code {}", code),
        );
        self.held.store(false, Ordering::SeqCst);
        for thread in self.threads() {
            thread.remove_conditions(|c| c.kind == ConditionKind::HardHold);
            thread.terminate(code);
        }
    }

    /// Freezes every thread until [`release`](Self::release), including
    /// threads created while the hold is in place.
    pub fn hold(&self) {
        info!("Holding job {}", self.id);
        let threads: Vec<_> = {
            let threads = self.threads.lock();
            self.held.store(true, Ordering::SeqCst);
            threads.values().cloned().collect()
        };
        for thread in threads {
            thread.add_condition(Condition::hard_hold());
        }
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }

    pub fn release(&self) {
        info!("Releasing job {}", self.id);
        let threads: Vec<_> = {
            let threads = self.threads.lock();
            self.held.store(false, Ordering::SeqCst);
            threads.values().cloned().collect()
        };
        for thread in threads {
            thread.remove_conditions(|c| c.kind == ConditionKind::HardHold);
            thread.schedule();
        }
    }

    pub fn pause_thread(&self, id: u64) -> Result<()> {
        self.thread(id)?.pause();
        Ok(())
    }

    pub fn resume_thread(&self, id: u64) -> Result<()> {
        self.thread(id)?.resume();
        Ok(())
    }

    pub fn step_into(&self, id: u64) -> Result<()> {
        self.thread(id)?.step_into();
        Ok(())
    }

    pub fn step_over(&self, id: u64) -> Result<()> {
        self.thread(id)?.step_over();
        Ok(())
    }

    /// Runs ad-hoc script code in a held thread's context.
    pub fn inject_script(&self, thread_id: u64, code: &str) -> Result<Value> {
        let thread = self.thread(thread_id)?;
        if !thread.is_held() {
            return Err(EngineError::ThreadNotHeld(thread_id));
        }
        Ok(thread.script().run(code, CompileMode::Exec)?)
    }

    pub fn add_breakpoint_function(&self, function: impl Into<String>) -> u64 {
        let breakpoint = Breakpoint::function(function);
        info!("Job {}: breakpoint on {}", self.id, breakpoint);
        self.breakpoints.lock().add(breakpoint)
    }

    pub fn add_breakpoint_line(
        &self,
        line: u32,
        file: impl Into<String>,
        machine: Option<String>,
    ) -> u64 {
        let breakpoint = Breakpoint::line(line, file, machine);
        info!("Job {}: breakpoint on {}", self.id, breakpoint);
        self.breakpoints.lock().add(breakpoint)
    }

    pub fn remove_breakpoint(&self, id: u64) -> Result<()> {
        self.breakpoints
            .lock()
            .remove(id)
            .map(|_| ())
            .ok_or(EngineError::BreakpointNotFound(id))
    }

    pub fn breakpoints(&self) -> Vec<(u64, Breakpoint)> {
        self.breakpoints.lock().list()
    }

    pub fn set_break_on_first_function(&self, enabled: bool) {
        self.break_on_first_function.store(enabled, Ordering::Release);
    }

    /// Suspension to apply when `action` is pushed: `Some(Some(id))` for a
    /// matching breakpoint, `Some(None)` for break-on-first-function.
    pub(crate) fn breakpoint_for(&self, action: &dyn Action) -> Option<Option<u64>> {
        if let Some(id) = self.breakpoints.lock().find_match(action) {
            return Some(Some(id));
        }
        if action.function_name().is_some()
            && self.break_on_first_function.swap(false, Ordering::AcqRel)
        {
            return Some(None);
        }
        None
    }

    /// Adds an entry to the job's log digest and the process log.
    pub fn log(&self, level: Level, message: impl Into<String>) {
        let message = message.into();
        log!(level, "[job {}] {}", self.id, message);
        self.inner.lock().log.push(JobLogEntry::new(level, message));
    }

    pub fn log_error(&self, message: impl Into<String>) {
        self.log(Level::Error, message);
    }

    pub fn log_entries(&self) -> Vec<JobLogEntry> {
        self.inner.lock().log.clone()
    }

    /// Tallies a testcase pass or failure for the detailed result.
    pub fn record_testcase(&self, name: &str, passed: bool, message: Option<String>) {
        self.inner
            .lock()
            .testcases
            .entry(name.to_string())
            .or_insert_with(|| TestcaseOutcome::new(name))
            .record(passed, message);
    }

    pub(crate) fn record_event(&self, subject: String, event_type: EventType, detail: Option<String>) {
        let mut timeline = self.timeline.lock();
        match detail {
            Some(detail) => timeline.add_event_with_detail(subject, event_type, detail),
            None => timeline.add_event(subject, event_type),
        }
    }

    pub fn timeline(&self) -> ExecutionTimeline {
        self.timeline.lock().clone()
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("document", &self.document.name())
            .field("threads", &self.thread_count())
            .finish()
    }
}
