//! Action Contract
//!
//! An action is one executable node of a parsed workflow tree. The
//! scheduler only ever talks to actions through [`Action`]: it executes the
//! action on top of a thread's stack one atomic step at a time, or hands it
//! the most urgent pending condition instead.

use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};

use crate::execution::{Condition, LogicalThread};

/// Where an action was declared in its source document.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SourceLocation {
    pub file: String,
    pub line: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine: Option<String>,
}

impl SourceLocation {
    /// Creates a location without a machine qualifier.
    pub fn new(file: impl Into<String>, line: u32) -> Self {
        Self {
            file: file.into(),
            line,
            machine: None,
        }
    }

    /// Qualifies the location with the machine the file was read from.
    pub fn on_machine(mut self, machine: impl Into<String>) -> Self {
        self.machine = Some(machine.into());
        self
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.machine {
            Some(machine) => write!(f, "{}:{}:{}", machine, self.file, self.line),
            None => write!(f, "{}:{}", self.file, self.line),
        }
    }
}

/// One executable workflow node.
///
/// `execute` must perform a single bounded step: push further actions,
/// pop itself, or both. It must never block the calling worker.
pub trait Action: Send + Sync + 'static {
    /// Kind tag this action was registered under.
    fn kind(&self) -> &'static str;

    /// Performs one step on `thread`.
    fn execute(&mut self, thread: &LogicalThread);

    /// Reacts to a delivered condition. The default unwinds: the action
    /// pops itself so the condition reaches the action below it.
    fn handle_condition(&mut self, thread: &LogicalThread, condition: &Condition) {
        let _ = condition;
        thread.pop_action();
    }

    /// Fresh, independent copy in its initial state.
    fn clone_action(&self) -> Box<dyn Action>;

    /// One-line description used for stack introspection.
    fn describe(&self) -> String {
        self.kind().to_string()
    }

    /// Name of the function this action calls, if it is a call.
    fn function_name(&self) -> Option<&str> {
        None
    }

    /// Declaration site, if known.
    fn location(&self) -> Option<&SourceLocation> {
        None
    }

    /// True only for the synthetic breakpoint wrapper.
    fn is_breakpoint(&self) -> bool {
        false
    }
}

/// Shared, lockable entry on a thread's action stack.
///
/// The running worker keeps its own handle while the action executes, so
/// an action may pop itself without being dropped mid-step.
#[derive(Clone)]
pub struct ActionHandle {
    action: Arc<Mutex<Box<dyn Action>>>,
    kind: &'static str,
    function: Option<Arc<str>>,
}

impl ActionHandle {
    pub fn new(action: Box<dyn Action>) -> Self {
        let kind = action.kind();
        let function = action.function_name().map(Arc::from);
        Self {
            action: Arc::new(Mutex::new(action)),
            kind,
            function,
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, Box<dyn Action>> {
        self.action.lock()
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub fn function_name(&self) -> Option<&str> {
        self.function.as_deref()
    }

    /// Describes the action without waiting on a worker that is executing it.
    pub fn describe(&self) -> String {
        match self.action.try_lock() {
            Some(action) => action.describe(),
            None => format!("{} (executing)", self.kind),
        }
    }
}

impl fmt::Debug for ActionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionHandle")
            .field("kind", &self.kind)
            .field("function", &self.function)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    impl Action for Noop {
        fn kind(&self) -> &'static str {
            "noop"
        }

        fn execute(&mut self, thread: &LogicalThread) {
            thread.pop_action();
        }

        fn clone_action(&self) -> Box<dyn Action> {
            Box::new(Noop)
        }
    }

    #[test]
    fn test_location_display() {
        let loc = SourceLocation::new("suite.xml", 12);
        assert_eq!(loc.to_string(), "suite.xml:12");
        assert_eq!(loc.on_machine("lab1").to_string(), "lab1:suite.xml:12");
    }

    #[test]
    fn test_handle_describe_while_locked() {
        let handle = ActionHandle::new(Box::new(Noop));
        assert_eq!(handle.describe(), "noop");

        let _guard = handle.lock();
        assert_eq!(handle.describe(), "noop (executing)");
    }

    #[test]
    fn test_handle_defaults() {
        let handle = ActionHandle::new(Box::new(Noop));
        assert_eq!(handle.kind(), "noop");
        assert!(handle.function_name().is_none());
        assert!(!handle.lock().is_breakpoint());
    }
}
