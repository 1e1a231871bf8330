//! Logical Threads
//!
//! A logical thread is one cooperatively scheduled strand of control flow:
//! an action stack, a priority-ordered condition set and a small state
//! machine. Workers run a thread by repeatedly executing the action on top
//! of its stack, or by delivering the most urgent pending condition to it.
//!
//! ```text
//! Init --schedule--> Runnable --dequeue--> Running --+--> Blocked --schedule--> Runnable
//!                                                    +--> Complete
//! ```
//!
//! A running thread gives its worker back in exactly three cases: it used
//! up its slice of [`FAIRNESS_CEILING`] steps, its stack is empty while
//! children are still running, or a hold-class condition is on top.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;

use super::breakpoint::BreakpointAction;
use super::condition::{Condition, ConditionKind, ConditionSet, HoldReason};
use super::job::{Job, ROOT_THREAD_ID};
use super::result::CompletionStatus;
use super::signals::{SignalHandlerFrame, DUPLICATE_SIGNAL_CODE, NO_SUCH_SIGNAL_HANDLER};
use crate::error::{EngineError, Result};
use crate::monitoring::EventType;
use crate::script::{ScriptContext, RESULT_VAR, SIGNAL_MESSAGE_VAR};
use crate::workflow::{Action, ActionHandle};

/// Steps a thread may take before yielding its worker.
pub const FAIRNESS_CEILING: u32 = 100;

/// Scheduling state of a logical thread.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Init,
    Runnable,
    Running,
    Blocked,
    Complete,
}

impl fmt::Display for ThreadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Called once with the completing thread's id.
pub type CompletionListener = Box<dyn FnOnce(u64) + Send>;

/// Point-in-time view of a thread for introspection.
#[derive(Serialize, Debug, Clone)]
pub struct ThreadSnapshot {
    pub id: u64,
    pub parent: Option<u64>,
    pub path: String,
    pub state: ThreadState,
    /// Functions currently being called, innermost first.
    pub call_stack: Vec<String>,
    /// Action stack descriptions, top first.
    pub actions: Vec<String>,
    /// Pending conditions in delivery order.
    pub conditions: Vec<String>,
    /// Signals whose handlers are running, innermost last.
    pub signals: Vec<String>,
    /// Signals with a handler bound on this thread, sorted.
    pub handlers: Vec<String>,
    pub children: Vec<u64>,
    pub steps: u64,
}

struct ThreadInner {
    state: ThreadState,
    stack: Vec<ActionHandle>,
    conditions: ConditionSet,
    children: BTreeSet<u64>,
    signal_stack: Vec<String>,
    handlers: HashMap<String, Arc<dyn Action>>,
    step_armed: bool,
    step_over_depth: Option<usize>,
    listeners: Vec<CompletionListener>,
    termination_code: Option<i64>,
    abnormal: bool,
}

enum Next {
    Yield,
    Block,
    Complete,
    Execute(ActionHandle),
    Handle(ActionHandle, Condition),
}

enum SignalRoute {
    Duplicate,
    Unhandled,
    Handler(Arc<dyn Action>),
}

/// One control-flow strand of a job.
pub struct LogicalThread {
    id: u64,
    parent: Option<u64>,
    lineage: Vec<u64>,
    job_id: u64,
    job: Weak<Job>,
    me: Weak<LogicalThread>,
    script: Arc<dyn ScriptContext>,
    inner: Mutex<ThreadInner>,
    steps: AtomicU64,
    yields: AtomicU64,
}

/// Inherited state handed to a new thread.
pub(crate) struct ThreadSeed {
    pub parent: Option<u64>,
    pub lineage: Vec<u64>,
    pub script: Arc<dyn ScriptContext>,
    pub handlers: HashMap<String, Arc<dyn Action>>,
    pub step_armed: bool,
}

impl LogicalThread {
    pub(crate) fn new(id: u64, job_id: u64, job: Weak<Job>, seed: ThreadSeed) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            id,
            parent: seed.parent,
            lineage: seed.lineage,
            job_id,
            job,
            me: me.clone(),
            script: seed.script,
            inner: Mutex::new(ThreadInner {
                state: ThreadState::Init,
                stack: Vec::new(),
                conditions: ConditionSet::new(),
                children: BTreeSet::new(),
                signal_stack: Vec::new(),
                handlers: seed.handlers,
                step_armed: seed.step_armed,
                step_over_depth: None,
                listeners: Vec::new(),
                termination_code: None,
                abnormal: false,
            }),
            steps: AtomicU64::new(0),
            yields: AtomicU64::new(0),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn parent_id(&self) -> Option<u64> {
        self.parent
    }

    pub fn job_id(&self) -> u64 {
        self.job_id
    }

    /// Dotted ids from the root thread down to this one, e.g. `1.2.5`.
    pub fn path(&self) -> String {
        self.lineage
            .iter()
            .chain(std::iter::once(&self.id))
            .map(u64::to_string)
            .collect::<Vec<_>>()
            .join(".")
    }

    pub fn job(&self) -> Option<Arc<Job>> {
        self.job.upgrade()
    }

    /// Owning handle to this thread, for callbacks that outlive a step.
    pub fn handle(&self) -> Option<Arc<LogicalThread>> {
        self.me.upgrade()
    }

    pub fn script(&self) -> &Arc<dyn ScriptContext> {
        &self.script
    }

    pub fn state(&self) -> ThreadState {
        self.inner.lock().state
    }

    pub fn stack_depth(&self) -> usize {
        self.inner.lock().stack.len()
    }

    pub fn children(&self) -> Vec<u64> {
        self.inner.lock().children.iter().copied().collect()
    }

    pub fn termination_code(&self) -> Option<i64> {
        self.inner.lock().termination_code
    }

    pub fn is_abnormal(&self) -> bool {
        self.inner.lock().abnormal
    }

    /// Total steps executed across all slices.
    pub fn steps_executed(&self) -> u64 {
        self.steps.load(Ordering::Relaxed)
    }

    /// Times the thread gave up its worker at the fairness ceiling.
    pub fn yields(&self) -> u64 {
        self.yields.load(Ordering::Relaxed)
    }

    /// True if a hold-class condition is the most urgent one pending.
    pub fn is_held(&self) -> bool {
        self.inner
            .lock()
            .conditions
            .first()
            .map_or(false, Condition::is_hold)
    }

    fn subject(&self) -> String {
        format!("thread-{}", self.id)
    }

    /// Pushes `action`, wrapping it in a suspension point if a breakpoint,
    /// a step request or break-on-first-function applies to it.
    pub fn push_action(&self, action: Box<dyn Action>) {
        let matched = match (action.is_breakpoint(), self.job()) {
            (false, Some(job)) => job.breakpoint_for(action.as_ref()),
            _ => None,
        };

        let mut inner = self.inner.lock();
        let action = if action.is_breakpoint() {
            action
        } else if let Some(breakpoint) = matched {
            Box::new(BreakpointAction::new(action, breakpoint))
        } else if inner.step_armed {
            inner.step_armed = false;
            Box::new(BreakpointAction::new(action, None))
        } else {
            action
        };
        inner.stack.push(ActionHandle::new(action));
    }

    /// Pops the top action. Returning to the depth recorded by a
    /// step-over arms suspension for the next push.
    pub fn pop_action(&self) -> Option<ActionHandle> {
        let mut inner = self.inner.lock();
        let popped = inner.stack.pop();
        if let Some(depth) = inner.step_over_depth {
            if inner.stack.len() < depth {
                inner.step_over_depth = None;
                inner.step_armed = true;
            }
        }
        popped
    }

    /// Adds a pending condition. The caller decides whether to reschedule.
    pub fn add_condition(&self, condition: Condition) -> bool {
        self.inner.lock().conditions.add(condition)
    }

    pub fn remove_conditions<F>(&self, predicate: F) -> usize
    where
        F: Fn(&Condition) -> bool,
    {
        self.inner.lock().conditions.remove_where(predicate)
    }

    pub fn has_condition<F>(&self, predicate: F) -> bool
    where
        F: Fn(&Condition) -> bool,
    {
        self.inner.lock().conditions.contains(predicate)
    }

    /// Records a termination request and reschedules. Unwinding happens
    /// the next time the thread runs.
    pub fn terminate(&self, code: i64) {
        {
            let mut inner = self.inner.lock();
            inner.conditions.add(Condition::terminate(code));
            inner.termination_code.get_or_insert(code);
        }
        debug!("Thread {} of job {} terminating with code {}", self.id, self.job_id, code);
        self.schedule();
    }

    /// Makes a blocked (or new) thread runnable and hands it to the pool.
    pub fn schedule(&self) {
        let first = {
            let mut inner = self.inner.lock();
            match inner.state {
                ThreadState::Init => {
                    inner.state = ThreadState::Runnable;
                    true
                }
                ThreadState::Blocked => {
                    inner.state = ThreadState::Runnable;
                    false
                }
                _ => return,
            }
        };

        let (Some(job), Some(me)) = (self.job(), self.handle()) else {
            warn!("Thread {} scheduled after its job was dropped", self.id);
            return;
        };
        if first {
            job.record_event(self.subject(), EventType::ThreadStarted, None);
        }
        job.pool().add(me);
    }

    /// Runs the thread until it yields, blocks or completes.
    pub fn run(&self) {
        {
            let mut inner = self.inner.lock();
            if inner.state != ThreadState::Runnable {
                debug!("Thread {} dequeued in state {}", self.id, inner.state);
                return;
            }
            inner.state = ThreadState::Running;
        }

        let mut slice = 0;
        loop {
            let next = {
                let mut inner = self.inner.lock();
                if slice >= FAIRNESS_CEILING {
                    inner.state = ThreadState::Blocked;
                    Next::Yield
                } else if inner.stack.is_empty() {
                    if inner.children.is_empty() {
                        inner.state = ThreadState::Complete;
                        Next::Complete
                    } else {
                        inner.state = ThreadState::Blocked;
                        Next::Block
                    }
                } else {
                    let top = inner.stack[inner.stack.len() - 1].clone();
                    match inner.conditions.first().cloned() {
                        Some(condition) if condition.is_hold() => {
                            inner.state = ThreadState::Blocked;
                            Next::Block
                        }
                        Some(condition) => Next::Handle(top, condition),
                        None => Next::Execute(top),
                    }
                }
            };

            match next {
                Next::Yield => {
                    self.yields.fetch_add(1, Ordering::Relaxed);
                    debug!("Thread {} yielding after {} steps", self.id, slice);
                    self.schedule();
                    return;
                }
                Next::Block => return,
                Next::Complete => {
                    self.finish();
                    return;
                }
                Next::Execute(handle) => {
                    handle.lock().execute(self);
                }
                Next::Handle(handle, condition) => {
                    handle.lock().handle_condition(self, &condition);
                }
            }
            slice += 1;
            self.steps.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Completion bookkeeping, run once when the stack empties for good.
    fn finish(&self) {
        let (inheritable, leftover_terminate, listeners, abnormal) = {
            let mut inner = self.inner.lock();
            let inheritable = inner.conditions.take_inheritable();
            let terminate = inner.conditions.iter().find_map(|c| match c.kind {
                ConditionKind::Terminate { code } => Some(code),
                _ => None,
            });
            inner.conditions.clear();
            (
                inheritable,
                terminate,
                std::mem::take(&mut inner.listeners),
                inner.abnormal,
            )
        };

        let job = self.job();
        if let Some(job) = &job {
            if self.id == ROOT_THREAD_ID {
                job.capture_result(self.script.get(RESULT_VAR).unwrap_or(Value::Null));
                if let Some(code) = leftover_terminate {
                    job.escalate(
                        CompletionStatus::Terminated,
                        Some(code),
                        format!("Terminated with code {}", code),
                    );
                }
                if let Some(condition) = inheritable.first() {
                    job.escalate(
                        CompletionStatus::Abnormal,
                        None,
                        format!("Unhandled condition {}", condition),
                    );
                }
            } else if let Some(parent) = self.parent.and_then(|id| job.thread(id).ok()) {
                for condition in inheritable {
                    debug!("Thread {} passing {} to thread {}", self.id, condition, parent.id);
                    parent.add_condition(condition);
                }
            }
            let detail = if abnormal { Some("abnormal".to_string()) } else { None };
            job.record_event(self.subject(), EventType::ThreadEnded, detail);
        }

        debug!("Thread {} of job {} complete", self.id, self.job_id);
        for listener in listeners {
            listener(self.id);
        }
        if let Some(job) = job {
            job.remove_thread(self.id);
        }
    }

    /// Forces a thread whose step panicked to completion.
    pub(crate) fn force_complete(&self, reason: &str) {
        {
            let mut inner = self.inner.lock();
            if inner.state == ThreadState::Complete {
                return;
            }
            inner.state = ThreadState::Complete;
            inner.stack.clear();
            inner.abnormal = true;
        }
        error!("Thread {} of job {} failed: {}", self.id, self.job_id, reason);
        if let Some(job) = self.job() {
            job.log_error(format!("[thread {}] {}", self.id, reason));
            job.escalate(
                CompletionStatus::Abnormal,
                None,
                format!("Thread {} failed: {}", self.id, reason),
            );
        }
        self.finish();
    }

    /// Registers `listener` to be called once when this thread completes.
    pub fn add_completion_listener(&self, listener: CompletionListener) {
        self.inner.lock().listeners.push(listener);
    }

    fn child_completed(&self, child: u64) {
        let last = {
            let mut inner = self.inner.lock();
            inner.children.remove(&child);
            inner.children.is_empty()
        };
        if last {
            self.schedule();
        }
    }

    /// Creates a child thread registered with the job.
    ///
    /// The child inherits signal handlers and the step flag, and either
    /// shares this thread's script context or gets a fork of it. The caller
    /// pushes the child's first action and schedules it.
    pub fn create_child(&self, share_script: bool) -> Result<Arc<LogicalThread>> {
        let job = self.job().ok_or(EngineError::JobNotFound(self.job_id))?;
        let (handlers, step_armed) = {
            let inner = self.inner.lock();
            (inner.handlers.clone(), inner.step_armed)
        };
        let script = if share_script {
            Arc::clone(&self.script)
        } else {
            self.script.fork()
        };
        let mut lineage = self.lineage.clone();
        lineage.push(self.id);

        let child = job.add_thread(ThreadSeed {
            parent: Some(self.id),
            lineage,
            script,
            handlers,
            step_armed,
        })?;

        self.inner.lock().children.insert(child.id);
        let parent = self.me.clone();
        child.add_completion_listener(Box::new(move |id| {
            if let Some(parent) = parent.upgrade() {
                parent.child_completed(id);
            }
        }));

        debug!("Thread {} created child {}", self.id, child.path());
        Ok(child)
    }

    /// Binds `handler` to the signal `name` on this thread.
    pub fn set_signal_handler(&self, name: impl Into<String>, handler: Arc<dyn Action>) {
        self.inner.lock().handlers.insert(name.into(), handler);
    }

    /// Signals whose handlers are currently running, innermost last.
    pub fn active_signals(&self) -> Vec<String> {
        self.inner.lock().signal_stack.clone()
    }

    /// Raises `name` after storing `message` in the signal message variable.
    pub fn signal_with_message(&self, name: &str, message: String) {
        self.script.set(SIGNAL_MESSAGE_VAR, Value::String(message));
        self.raise_signal(name);
    }

    /// Runs the handler bound to `name` on top of the current stack.
    ///
    /// Raising a signal that is already being handled on this thread
    /// terminates the thread. A signal without a handler raises
    /// [`NO_SUCH_SIGNAL_HANDLER`] instead; if that one has no handler
    /// either, the fault is logged and dropped.
    pub fn raise_signal(&self, name: &str) {
        let job = self.job();
        if let Some(job) = &job {
            job.record_event(self.subject(), EventType::SignalRaised, Some(name.to_string()));
        }

        let route = {
            let mut inner = self.inner.lock();
            if inner.signal_stack.iter().any(|active| active == name) {
                inner.abnormal = true;
                SignalRoute::Duplicate
            } else {
                match inner.handlers.get(name).cloned() {
                    Some(handler) => {
                        inner.signal_stack.push(name.to_string());
                        SignalRoute::Handler(handler)
                    }
                    None => SignalRoute::Unhandled,
                }
            }
        };

        match route {
            SignalRoute::Duplicate => {
                let message = format!(
                    "Signal {} raised on thread {} while already being handled",
                    name, self.id
                );
                match &job {
                    Some(job) => {
                        job.log_error(message.clone());
                        job.escalate(CompletionStatus::Abnormal, Some(DUPLICATE_SIGNAL_CODE), message);
                    }
                    None => error!("{}", message),
                }
                self.terminate(DUPLICATE_SIGNAL_CODE);
            }
            SignalRoute::Unhandled if name == NO_SUCH_SIGNAL_HANDLER => {
                let message = format!(
                    "No handler for {} on thread {}; signal dropped",
                    NO_SUCH_SIGNAL_HANDLER, self.id
                );
                match &job {
                    Some(job) => job.log_error(message),
                    None => error!("{}", message),
                }
            }
            SignalRoute::Unhandled => {
                self.signal_with_message(
                    NO_SUCH_SIGNAL_HANDLER,
                    format!("No signal handler exists for signal {}", name),
                );
            }
            SignalRoute::Handler(handler) => {
                debug!("Thread {} handling signal {}", self.id, name);
                self.push_action(Box::new(SignalHandlerFrame::new(name)));
                self.push_action(handler.clone_action());
            }
        }
    }

    /// Marks the innermost activation of `name` as handled.
    pub fn handled_signal(&self, name: &str) {
        let mut inner = self.inner.lock();
        if let Some(pos) = inner.signal_stack.iter().rposition(|active| active == name) {
            inner.signal_stack.remove(pos);
        }
    }

    /// Holds the thread at a breakpoint. Called by the breakpoint wrapper.
    pub(crate) fn suspend_at_breakpoint(&self, breakpoint: Option<u64>, at: &str) {
        self.add_condition(Condition::hold(HoldReason::Breakpoint(breakpoint)));
        match breakpoint {
            Some(id) => info!("Thread {} stopped at breakpoint {} before {}", self.id, id, at),
            None => info!("Thread {} stepped to {}", self.id, at),
        }
        if let Some(job) = self.job() {
            job.record_event(self.subject(), EventType::BreakpointHit, Some(at.to_string()));
        }
    }

    /// Holds the thread as soon as its current step finishes.
    pub fn pause(&self) {
        self.add_condition(Condition::hold(HoldReason::Pause));
    }

    /// Releases pause and breakpoint holds and reschedules.
    pub fn resume(&self) {
        self.release_debug_holds();
        self.schedule();
    }

    /// Resumes and suspends again before the very next action runs.
    pub fn step_into(&self) {
        self.inner.lock().step_armed = true;
        self.resume();
    }

    /// Resumes and suspends again once the current top action has
    /// completed, at the next action pushed at or below its depth.
    pub fn step_over(&self) {
        {
            let mut inner = self.inner.lock();
            let depth = inner.stack.len();
            inner.step_over_depth = Some(depth);
            inner.step_armed = false;
        }
        self.resume();
    }

    fn release_debug_holds(&self) {
        self.remove_conditions(|c| {
            matches!(
                c.kind,
                ConditionKind::Hold(HoldReason::Pause) | ConditionKind::Hold(HoldReason::Breakpoint(_))
            )
        });
    }

    /// Every variable visible to this thread's script context.
    pub fn variables(&self) -> BTreeMap<String, Value> {
        self.script.locals()
    }

    pub fn snapshot(&self) -> ThreadSnapshot {
        let inner = self.inner.lock();
        ThreadSnapshot {
            id: self.id,
            parent: self.parent,
            path: self.path(),
            state: inner.state,
            call_stack: inner
                .stack
                .iter()
                .rev()
                .filter_map(|h| h.function_name().map(str::to_string))
                .collect(),
            actions: inner.stack.iter().rev().map(ActionHandle::describe).collect(),
            conditions: inner.conditions.iter().map(Condition::to_string).collect(),
            signals: inner.signal_stack.clone(),
            handlers: {
                let mut names: Vec<String> = inner.handlers.keys().cloned().collect();
                names.sort();
                names
            },
            children: inner.children.iter().copied().collect(),
            steps: self.steps.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for LogicalThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogicalThread")
            .field("id", &self.id)
            .field("job", &self.job_id)
            .field("parent", &self.parent)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::execution::job::JobOptions;
    use crate::execution::testing::{document, pending_job, script, sequence, TIMEOUT};
    use crate::workflow::{CallAction, ScriptAction, SpawnAction};

    /// Spins until the root thread has blocked on its children.
    struct AwaitParentBlocked;

    impl Action for AwaitParentBlocked {
        fn kind(&self) -> &'static str {
            "await-parent"
        }

        fn execute(&mut self, thread: &LogicalThread) {
            let root = thread.job().and_then(|job| job.thread(ROOT_THREAD_ID).ok()).unwrap();
            let deadline = std::time::Instant::now() + TIMEOUT;
            while root.state() != ThreadState::Blocked {
                assert!(std::time::Instant::now() < deadline, "parent never blocked");
                std::thread::sleep(std::time::Duration::from_millis(1));
            }
            thread.pop_action();
        }

        fn clone_action(&self) -> Box<dyn Action> {
            Box::new(AwaitParentBlocked)
        }
    }

    /// Leaves an inheritable exception pending on its thread.
    struct Throw;

    impl Action for Throw {
        fn kind(&self) -> &'static str {
            "throw"
        }

        fn execute(&mut self, thread: &LogicalThread) {
            thread.add_condition(Condition::exception("Boom", json!({ "step": 1 })));
        }

        fn clone_action(&self) -> Box<dyn Action> {
            Box::new(Throw)
        }
    }

    fn idle_job() -> Arc<Job> {
        pending_job(document(ScriptAction::new("x = 1")), JobOptions::default())
    }

    #[test]
    fn test_fairness_ceiling_yields() {
        let mut body = vec![script("n = 0")];
        body.extend((0..150).map(|_| script("n = n + 1")));
        body.push(script("RESULT = n"));

        let job = pending_job(document(sequence(body)), JobOptions::default());
        let root = job.thread(ROOT_THREAD_ID).unwrap();
        job.start_execution().unwrap();
        assert!(job.wait(TIMEOUT));

        assert_eq!(job.result(), json!(150));
        assert!(root.yields() >= 1);
        assert!(root.steps_executed() > u64::from(FAIRNESS_CEILING));
        assert_eq!(root.state(), ThreadState::Complete);
    }

    #[test]
    fn test_children_share_context() {
        let spawn = SpawnAction::new(vec![script("a = 1"), script("b = 2")], true);
        let job = pending_job(document(spawn), JobOptions::default());
        let root = job.thread(ROOT_THREAD_ID).unwrap();
        job.start_execution().unwrap();
        assert!(job.wait(TIMEOUT));

        assert_eq!(root.script().get("a"), Some(json!(1)));
        assert_eq!(root.script().get("b"), Some(json!(2)));
        assert!(root.children().is_empty());

        let timeline = job.timeline();
        assert_eq!(timeline.count(EventType::ThreadStarted), 3);
        assert_eq!(timeline.count(EventType::ThreadEnded), 3);
    }

    #[test]
    fn test_parent_resumes_once_after_children() {
        let branch = || -> Arc<dyn Action> {
            let mut steps: Vec<Arc<dyn Action>> = vec![Arc::new(AwaitParentBlocked)];
            steps.extend((0..20).map(|_| script("counter = counter + 1")));
            Arc::new(sequence(steps))
        };
        let body = sequence(vec![
            script("counter = 0"),
            Arc::new(SpawnAction::new(vec![branch(), branch()], true)),
        ]);

        let job = pending_job(document(body), JobOptions::default());
        let root = job.thread(ROOT_THREAD_ID).unwrap();
        job.start_execution().unwrap();
        assert!(job.wait(TIMEOUT));

        assert_eq!(job.outcome().status, CompletionStatus::Normal);
        assert_eq!(root.script().get("counter"), Some(json!(40)));
        // Root runs once until it blocks and once more after the last child;
        // each child runs once.
        assert_eq!(job.pool().runs(), 4);
        assert_eq!(root.yields(), 0);
    }

    #[test]
    fn test_child_exception_reaches_job() {
        let child = sequence(vec![Arc::new(Throw), script("never = 1")]);
        let body = sequence(vec![
            script("RESULT = 7"),
            Arc::new(SpawnAction::new(vec![Arc::new(child)], true)),
        ]);
        let job = pending_job(document(body), JobOptions::default());
        let root = job.thread(ROOT_THREAD_ID).unwrap();
        job.start_execution().unwrap();
        assert!(job.wait(TIMEOUT));

        let outcome = job.outcome();
        assert_eq!(outcome.status, CompletionStatus::Abnormal);
        assert_eq!(outcome.reason.as_deref(), Some("Unhandled condition Exception(Boom)"));
        assert_eq!(job.result(), json!(7));
        assert!(root.script().get("never").is_none());
        assert_eq!(job.pool().panics(), 0);
    }

    #[test]
    fn test_children_fork_context() {
        let spawn = SpawnAction::new(vec![script("a = 1")], false);
        let job = pending_job(document(spawn), JobOptions::default());
        let root = job.thread(ROOT_THREAD_ID).unwrap();
        job.start_execution().unwrap();
        assert!(job.wait(TIMEOUT));

        assert!(root.script().get("a").is_none());
        assert_eq!(job.outcome().status, CompletionStatus::Normal);
    }

    #[test]
    fn test_child_lineage() {
        let job = idle_job();
        let root = job.thread(ROOT_THREAD_ID).unwrap();
        root.script().set("shared", json!(true));

        let child = root.create_child(false).unwrap();
        let grandchild = child.create_child(true).unwrap();

        assert_eq!(child.id(), 2);
        assert_eq!(child.parent_id(), Some(ROOT_THREAD_ID));
        assert_eq!(child.path(), "1.2");
        assert_eq!(grandchild.path(), "1.2.3");
        assert_eq!(root.children(), vec![2]);
        assert_eq!(job.thread_count(), 3);
        assert_eq!(grandchild.script().get("shared"), Some(json!(true)));

        let snapshot = child.snapshot();
        assert_eq!(snapshot.state, ThreadState::Init);
        assert_eq!(snapshot.children, vec![3]);
    }

    #[test]
    fn test_create_child_respects_cap() {
        let options = JobOptions {
            max_threads: Some(1),
            ..JobOptions::default()
        };
        let job = pending_job(document(ScriptAction::new("x = 1")), options);
        let root = job.thread(ROOT_THREAD_ID).unwrap();

        root.create_child(false).unwrap();
        assert!(matches!(
            root.create_child(false),
            Err(EngineError::ThreadLimitExceeded { job: 1, limit: 1 })
        ));
        assert_eq!(job.thread_count(), 2);
        assert_eq!(root.children().len(), 1);
    }

    #[test]
    fn test_condition_order() {
        let job = idle_job();
        let root = job.thread(ROOT_THREAD_ID).unwrap();

        root.pause();
        assert!(root.is_held());
        root.add_condition(Condition::terminate(3));
        assert!(!root.is_held());
        assert_eq!(root.snapshot().conditions[0], "Terminate(3)");

        assert_eq!(root.remove_conditions(Condition::is_hold), 1);
        assert!(root.has_condition(|c| c.kind == ConditionKind::Terminate { code: 3 }));
    }

    #[test]
    fn test_signal_handler_frame() {
        let job = idle_job();
        let root = job.thread(ROOT_THREAD_ID).unwrap();
        root.set_signal_handler("Sig", Arc::new(ScriptAction::new("handled = 1")));

        assert_eq!(root.snapshot().handlers, vec!["Sig"]);

        root.raise_signal("Sig");
        assert_eq!(root.active_signals(), vec!["Sig"]);
        assert_eq!(
            root.snapshot().actions,
            vec!["script handled = 1", "handling Sig"]
        );
    }

    #[test]
    fn test_missing_handler_of_last_resort() {
        let job = idle_job();
        let root = job.thread(ROOT_THREAD_ID).unwrap();

        root.raise_signal("Unknown");
        assert_eq!(root.stack_depth(), 0);
        assert_eq!(
            root.script().get(SIGNAL_MESSAGE_VAR),
            Some(json!("No signal handler exists for signal Unknown"))
        );
        assert!(job
            .log_entries()
            .iter()
            .any(|e| e.is_error() && e.message.ends_with("signal dropped")));
        assert_eq!(job.timeline().count(EventType::SignalRaised), 2);
    }

    #[test]
    fn test_push_wraps_breakpoints() {
        let job = idle_job();
        let root = job.thread(ROOT_THREAD_ID).unwrap();
        job.add_breakpoint_function("setup");

        root.push_action(Box::new(CallAction::new("teardown")));
        root.push_action(Box::new(CallAction::new("setup")));

        let snapshot = root.snapshot();
        assert_eq!(snapshot.actions, vec!["call setup [breakpoint 1]", "call teardown"]);
        assert_eq!(snapshot.call_stack, vec!["setup", "teardown"]);

        assert!(root.pop_action().is_some());
        assert_eq!(root.stack_depth(), 1);
    }

    #[test]
    fn test_push_pop_pairs_restore_depth() {
        let job = idle_job();
        let root = job.thread(ROOT_THREAD_ID).unwrap();
        job.add_breakpoint_function("setup");
        root.push_action(Box::new(CallAction::new("main")));
        let base = root.stack_depth();

        for round in 0..8 {
            root.inner.lock().step_armed = round % 2 == 0;
            root.push_action(Box::new(CallAction::new("setup")));
            root.push_action(Box::new(CallAction::new("teardown")));
            assert_eq!(root.stack_depth(), base + 2);
            if round % 2 == 0 {
                assert_eq!(
                    root.snapshot().actions[..2],
                    ["call teardown [step]", "call setup [breakpoint 1]"]
                );
            }

            root.pop_action();
            root.pop_action();
            assert_eq!(root.stack_depth(), base);
        }

        // A step-over recorded above the base re-arms on the way back down.
        root.inner.lock().step_over_depth = Some(base + 1);
        root.push_action(Box::new(CallAction::new("teardown")));
        root.pop_action();
        root.push_action(Box::new(CallAction::new("teardown")));
        assert_eq!(root.snapshot().actions[0], "call teardown [step]");
        root.pop_action();
        assert_eq!(root.stack_depth(), base);
    }
}
