//! Built-in Actions
//!
//! The small set of action kinds the engine itself relies on: function
//! calls, sequences, script blocks, signal raising, termination, thread
//! spawning and remote commands. Richer element kinds live outside the
//! engine and plug in through the [`ActionRegistry`](super::ActionRegistry).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::Mutex;
use serde_json::Value;

use super::action::{Action, SourceLocation};
use crate::execution::signals::{
    COMMAND_FAILED, COMMAND_START_ERROR, FUNCTION_DOES_NOT_EXIST, MAX_THREADS_EXCEEDED,
    SCRIPT_EVALUATION_ERROR,
};
use crate::execution::{Condition, ConditionKind, HoldReason, LogicalThread};
use crate::remote::CommandResult;
use crate::script::{CompileMode, ARGS_VAR, RC_VAR, RESULT_VAR};

/// Source of hold tokens tying a command completion to its wait.
static COMMAND_TOKENS: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq)]
enum CallState {
    Pending,
    InBody,
}

/// Calls a function from the job's document.
///
/// The call frame stays on the stack while the body runs so that it shows
/// up in call-stack introspection; the body leaves its return value in
/// `RESULT`.
#[derive(Debug, Clone)]
pub struct CallAction {
    function: String,
    args: Option<String>,
    location: Option<SourceLocation>,
    state: CallState,
}

impl CallAction {
    pub fn new(function: impl Into<String>) -> Self {
        Self {
            function: function.into(),
            args: None,
            location: None,
            state: CallState::Pending,
        }
    }

    /// Argument expression evaluated in the caller's context.
    pub fn with_args(mut self, args: impl Into<String>) -> Self {
        self.args = Some(args.into());
        self
    }

    pub fn at_location(mut self, location: Option<SourceLocation>) -> Self {
        self.location = location;
        self
    }
}

impl Action for CallAction {
    fn kind(&self) -> &'static str {
        "call"
    }

    fn execute(&mut self, thread: &LogicalThread) {
        if self.state == CallState::InBody {
            thread.pop_action();
            return;
        }

        let body = thread
            .job()
            .and_then(|job| job.document().function(&self.function).map(|f| f.body.clone()));
        let Some(body) = body else {
            thread.pop_action();
            thread.signal_with_message(
                FUNCTION_DOES_NOT_EXIST,
                format!("Function '{}' does not exist", self.function),
            );
            return;
        };

        let args = match &self.args {
            Some(expr) => match thread.script().run(expr, CompileMode::Eval) {
                Ok(value) => value,
                Err(e) => {
                    thread.pop_action();
                    thread.signal_with_message(
                        SCRIPT_EVALUATION_ERROR,
                        format!("Arguments to function '{}': {}", self.function, e),
                    );
                    return;
                }
            },
            None => Value::Null,
        };

        debug!("Thread {} calling function '{}'", thread.id(), self.function);
        thread.script().set(ARGS_VAR, args);
        self.state = CallState::InBody;
        thread.push_action(body.clone_action());
    }

    fn clone_action(&self) -> Box<dyn Action> {
        Box::new(Self {
            state: CallState::Pending,
            ..self.clone()
        })
    }

    fn describe(&self) -> String {
        format!("call {}", self.function)
    }

    fn function_name(&self) -> Option<&str> {
        Some(&self.function)
    }

    fn location(&self) -> Option<&SourceLocation> {
        self.location.as_ref()
    }
}

/// Runs its children one after another.
#[derive(Clone)]
pub struct SequenceAction {
    children: Arc<Vec<Arc<dyn Action>>>,
    next: usize,
    location: Option<SourceLocation>,
}

impl SequenceAction {
    pub fn new(children: Vec<Arc<dyn Action>>) -> Self {
        Self {
            children: Arc::new(children),
            next: 0,
            location: None,
        }
    }

    pub fn at_location(mut self, location: Option<SourceLocation>) -> Self {
        self.location = location;
        self
    }
}

impl Action for SequenceAction {
    fn kind(&self) -> &'static str {
        "sequence"
    }

    fn execute(&mut self, thread: &LogicalThread) {
        match self.children.get(self.next) {
            Some(child) => {
                self.next += 1;
                thread.push_action(child.clone_action());
            }
            None => {
                thread.pop_action();
            }
        }
    }

    fn clone_action(&self) -> Box<dyn Action> {
        Box::new(Self {
            next: 0,
            ..self.clone()
        })
    }

    fn describe(&self) -> String {
        format!("sequence ({} children)", self.children.len())
    }

    fn location(&self) -> Option<&SourceLocation> {
        self.location.as_ref()
    }
}

/// Executes a block of script code in the thread's context.
#[derive(Debug, Clone)]
pub struct ScriptAction {
    code: String,
    location: Option<SourceLocation>,
}

impl ScriptAction {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            location: None,
        }
    }

    pub fn at_location(mut self, location: Option<SourceLocation>) -> Self {
        self.location = location;
        self
    }
}

impl Action for ScriptAction {
    fn kind(&self) -> &'static str {
        "script"
    }

    fn execute(&mut self, thread: &LogicalThread) {
        thread.pop_action();
        if let Err(e) = thread.script().run(&self.code, CompileMode::Exec) {
            let at = self
                .location
                .as_ref()
                .map(|l| format!(" at {}", l))
                .unwrap_or_default();
            thread.signal_with_message(SCRIPT_EVALUATION_ERROR, format!("{}{}", e, at));
        }
    }

    fn clone_action(&self) -> Box<dyn Action> {
        Box::new(self.clone())
    }

    fn describe(&self) -> String {
        let first_line = self.code.lines().next().unwrap_or_default();
        format!("script {}", first_line)
    }

    fn location(&self) -> Option<&SourceLocation> {
        self.location.as_ref()
    }
}

/// Raises a named signal on the current thread.
#[derive(Debug, Clone)]
pub struct RaiseAction {
    signal: String,
    message: Option<String>,
}

impl RaiseAction {
    pub fn new(signal: impl Into<String>) -> Self {
        Self {
            signal: signal.into(),
            message: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

impl Action for RaiseAction {
    fn kind(&self) -> &'static str {
        "raise"
    }

    fn execute(&mut self, thread: &LogicalThread) {
        thread.pop_action();
        match &self.message {
            Some(message) => thread.signal_with_message(&self.signal, message.clone()),
            None => thread.raise_signal(&self.signal),
        }
    }

    fn clone_action(&self) -> Box<dyn Action> {
        Box::new(self.clone())
    }

    fn describe(&self) -> String {
        format!("raise {}", self.signal)
    }
}

/// What a [`TerminateAction`] stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateScope {
    Thread,
    Job,
}

/// Terminates the current thread or the whole job.
#[derive(Debug, Clone)]
pub struct TerminateAction {
    scope: TerminateScope,
    code: i64,
}

impl TerminateAction {
    pub fn new(scope: TerminateScope, code: i64) -> Self {
        Self { scope, code }
    }
}

impl Action for TerminateAction {
    fn kind(&self) -> &'static str {
        "terminate"
    }

    fn execute(&mut self, thread: &LogicalThread) {
        thread.pop_action();
        match self.scope {
            TerminateScope::Thread => thread.terminate(self.code),
            TerminateScope::Job => match thread.job() {
                Some(job) => job.terminate(self.code),
                None => thread.terminate(self.code),
            },
        }
    }

    fn clone_action(&self) -> Box<dyn Action> {
        Box::new(self.clone())
    }

    fn describe(&self) -> String {
        format!("terminate {:?} ({})", self.scope, self.code)
    }
}

/// Starts each branch on its own child thread, then pops itself.
///
/// The spawning thread keeps running whatever is below on its stack and
/// only waits for the children once its own stack is empty.
#[derive(Clone)]
pub struct SpawnAction {
    branches: Arc<Vec<Arc<dyn Action>>>,
    share_context: bool,
}

impl SpawnAction {
    pub fn new(branches: Vec<Arc<dyn Action>>, share_context: bool) -> Self {
        Self {
            branches: Arc::new(branches),
            share_context,
        }
    }
}

impl Action for SpawnAction {
    fn kind(&self) -> &'static str {
        "spawn"
    }

    fn execute(&mut self, thread: &LogicalThread) {
        thread.pop_action();
        for branch in self.branches.iter() {
            match thread.create_child(self.share_context) {
                Ok(child) => {
                    child.push_action(branch.clone_action());
                    child.schedule();
                }
                Err(e) => {
                    thread.signal_with_message(MAX_THREADS_EXCEEDED, e.to_string());
                    break;
                }
            }
        }
    }

    fn clone_action(&self) -> Box<dyn Action> {
        Box::new(self.clone())
    }

    fn describe(&self) -> String {
        format!("spawn ({} branches)", self.branches.len())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum CommandState {
    Pending,
    Waiting(u64),
}

/// Submits a request to a service on a remote machine and waits for it
/// without occupying a worker: the thread is held until the completion
/// callback releases it.
#[derive(Debug, Clone)]
pub struct CommandAction {
    machine: String,
    service: String,
    request: String,
    state: CommandState,
    outcome: Arc<Mutex<Option<CommandResult>>>,
}

impl CommandAction {
    pub fn new(
        machine: impl Into<String>,
        service: impl Into<String>,
        request: impl Into<String>,
    ) -> Self {
        Self {
            machine: machine.into(),
            service: service.into(),
            request: request.into(),
            state: CommandState::Pending,
            outcome: Arc::new(Mutex::new(None)),
        }
    }

    fn submit(&mut self, thread: &LogicalThread) {
        let client = thread.job().and_then(|job| job.remote_client());
        let (Some(client), Some(handle)) = (client, thread.handle()) else {
            thread.pop_action();
            thread.signal_with_message(
                COMMAND_START_ERROR,
                format!("No remote command client available for {}", self.machine),
            );
            return;
        };

        let token = COMMAND_TOKENS.fetch_add(1, Ordering::Relaxed);
        // The hold must exist before the callback can possibly fire.
        thread.add_condition(Condition::hold(HoldReason::Command(token)));
        self.state = CommandState::Waiting(token);

        let outcome = Arc::clone(&self.outcome);
        let submitted = client.submit_async(
            &self.machine,
            &self.service,
            &self.request,
            Box::new(move |result| {
                *outcome.lock() = Some(result);
                handle.remove_conditions(|c| c.kind == ConditionKind::Hold(HoldReason::Command(token)));
                handle.schedule();
            }),
        );

        match submitted {
            Ok(request_id) => {
                debug!(
                    "Thread {} submitted request {} to {} on {}",
                    thread.id(),
                    request_id,
                    self.service,
                    self.machine
                );
            }
            Err(e) => {
                self.release(thread);
                thread.pop_action();
                thread.signal_with_message(COMMAND_START_ERROR, e.to_string());
            }
        }
    }

    fn release(&self, thread: &LogicalThread) {
        if let CommandState::Waiting(token) = self.state {
            thread.remove_conditions(|c| c.kind == ConditionKind::Hold(HoldReason::Command(token)));
        }
    }
}

impl Action for CommandAction {
    fn kind(&self) -> &'static str {
        "command"
    }

    fn execute(&mut self, thread: &LogicalThread) {
        let token = match self.state {
            CommandState::Pending => return self.submit(thread),
            CommandState::Waiting(token) => token,
        };

        let Some(result) = self.outcome.lock().take() else {
            warn!("Thread {} resumed before its command completed", thread.id());
            thread.add_condition(Condition::hold(HoldReason::Command(token)));
            return;
        };

        thread.pop_action();
        let script = thread.script();
        script.set(RC_VAR, Value::from(result.code));
        script.set(RESULT_VAR, Value::String(result.payload.clone()));

        if result.code != 0 {
            thread.signal_with_message(
                COMMAND_FAILED,
                format!(
                    "{} request to {} failed with RC {}: {}",
                    self.service, self.machine, result.code, result.payload
                ),
            );
        } else {
            info!("{} request to {} completed", self.service, self.machine);
        }
    }

    fn handle_condition(&mut self, thread: &LogicalThread, condition: &Condition) {
        debug!("Command to {} unwinding on {}", self.machine, condition);
        self.release(thread);
        thread.pop_action();
    }

    fn clone_action(&self) -> Box<dyn Action> {
        Box::new(Self::new(
            self.machine.clone(),
            self.service.clone(),
            self.request.clone(),
        ))
    }

    fn describe(&self) -> String {
        format!("command {} {} {}", self.machine, self.service, self.request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_clone_resets_state() {
        let mut call = CallAction::new("setup").with_args("[1, 2]");
        call.state = CallState::InBody;

        let copy = call.clone_action();
        assert_eq!(copy.describe(), "call setup");
        assert_eq!(copy.function_name(), Some("setup"));
        assert_eq!(call.clone().state, CallState::InBody);
    }

    #[test]
    fn test_sequence_clone_restarts() {
        let children: Vec<Arc<dyn Action>> = vec![
            Arc::new(ScriptAction::new("a = 1")),
            Arc::new(ScriptAction::new("b = 2")),
        ];
        let mut sequence = SequenceAction::new(children);
        sequence.next = 2;

        let copy = sequence.clone_action();
        assert_eq!(copy.describe(), "sequence (2 children)");
        assert_eq!(copy.kind(), "sequence");
    }

    #[test]
    fn test_script_describe_first_line() {
        let script = ScriptAction::new("x = 1\ny = 2")
            .at_location(Some(SourceLocation::new("suite.yaml", 4)));
        assert_eq!(script.describe(), "script x = 1");
        assert_eq!(script.location().unwrap().line, 4);
    }

    #[test]
    fn test_command_clone_is_fresh() {
        let mut command = CommandAction::new("lab1", "PROCESS", "START COMMAND ls");
        command.state = CommandState::Waiting(9);
        *command.outcome.lock() = Some(CommandResult::ok("done"));

        let copy = command.clone_action();
        assert_eq!(copy.describe(), "command lab1 PROCESS START COMMAND ls");
        assert!(command.outcome.lock().is_some());
    }

    #[test]
    fn test_describe_builtins() {
        assert_eq!(RaiseAction::new("Halt").describe(), "raise Halt");
        assert_eq!(
            TerminateAction::new(TerminateScope::Job, 3).describe(),
            "terminate Job (3)"
        );
        let spawn = SpawnAction::new(vec![Arc::new(RaiseAction::new("Halt"))], true);
        assert_eq!(spawn.describe(), "spawn (1 branches)");
    }
}
