//! Breakpoints
//!
//! A breakpoint matches actions by the function they call or by their
//! declaration site. A matching push is wrapped in a [`BreakpointAction`],
//! which suspends the thread the first time it runs and behaves exactly
//! like the wrapped action afterwards, so stack depth is unaffected.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::cache::normalize_path;
use crate::execution::{Condition, LogicalThread};
use crate::workflow::{Action, SourceLocation};

/// What a breakpoint matches.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub enum Breakpoint {
    Function(String),
    Line {
        line: u32,
        file: String,
        machine: Option<String>,
    },
}

impl Breakpoint {
    pub fn function(name: impl Into<String>) -> Self {
        Breakpoint::Function(name.into())
    }

    pub fn line(line: u32, file: impl Into<String>, machine: Option<String>) -> Self {
        Breakpoint::Line {
            line,
            file: file.into(),
            machine,
        }
    }

    pub fn matches(&self, action: &dyn Action) -> bool {
        match self {
            Breakpoint::Function(name) => action.function_name() == Some(name.as_str()),
            Breakpoint::Line {
                line,
                file,
                machine,
            } => action
                .location()
                .map_or(false, |location| line_matches(location, *line, file, machine)),
        }
    }
}

fn line_matches(location: &SourceLocation, line: u32, file: &str, machine: &Option<String>) -> bool {
    if location.line != line || normalize_path(&location.file) != normalize_path(file) {
        return false;
    }
    match (machine, &location.machine) {
        (None, _) => true,
        (Some(wanted), Some(actual)) => wanted.eq_ignore_ascii_case(actual),
        (Some(_), None) => false,
    }
}

impl fmt::Display for Breakpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Breakpoint::Function(name) => write!(f, "function {}", name),
            Breakpoint::Line {
                line,
                file,
                machine: Some(machine),
            } => write!(f, "line {} of {}:{}", line, machine, file),
            Breakpoint::Line { line, file, .. } => write!(f, "line {} of {}", line, file),
        }
    }
}

/// Breakpoints of one job, keyed by monotonically increasing id.
#[derive(Debug)]
pub struct BreakpointTable {
    next_id: u64,
    entries: BTreeMap<u64, Breakpoint>,
}

impl Default for BreakpointTable {
    fn default() -> Self {
        Self {
            next_id: 1,
            entries: BTreeMap::new(),
        }
    }
}

impl BreakpointTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `breakpoint`; ids are never reused.
    pub fn add(&mut self, breakpoint: Breakpoint) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.insert(id, breakpoint);
        id
    }

    pub fn remove(&mut self, id: u64) -> Option<Breakpoint> {
        self.entries.remove(&id)
    }

    /// Id of the first breakpoint matching `action`.
    pub fn find_match(&self, action: &dyn Action) -> Option<u64> {
        self.entries
            .iter()
            .find(|(_, bp)| bp.matches(action))
            .map(|(id, _)| *id)
    }

    pub fn list(&self) -> Vec<(u64, Breakpoint)> {
        self.entries
            .iter()
            .map(|(id, bp)| (*id, bp.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Suspension wrapper inserted at push time.
pub struct BreakpointAction {
    inner: Box<dyn Action>,
    breakpoint: Option<u64>,
    hit: bool,
}

impl BreakpointAction {
    /// `breakpoint` is `None` when the suspension comes from a step request
    /// or from break-on-first-function.
    pub fn new(inner: Box<dyn Action>, breakpoint: Option<u64>) -> Self {
        Self {
            inner,
            breakpoint,
            hit: false,
        }
    }
}

impl Action for BreakpointAction {
    fn kind(&self) -> &'static str {
        self.inner.kind()
    }

    fn execute(&mut self, thread: &LogicalThread) {
        if self.hit {
            self.inner.execute(thread);
            return;
        }
        self.hit = true;
        thread.suspend_at_breakpoint(self.breakpoint, &self.inner.describe());
    }

    fn handle_condition(&mut self, thread: &LogicalThread, condition: &Condition) {
        self.inner.handle_condition(thread, condition);
    }

    fn clone_action(&self) -> Box<dyn Action> {
        self.inner.clone_action()
    }

    fn describe(&self) -> String {
        match self.breakpoint {
            Some(id) => format!("{} [breakpoint {}]", self.inner.describe(), id),
            None => format!("{} [step]", self.inner.describe()),
        }
    }

    fn function_name(&self) -> Option<&str> {
        self.inner.function_name()
    }

    fn location(&self) -> Option<&SourceLocation> {
        self.inner.location()
    }

    fn is_breakpoint(&self) -> bool {
        true
    }
}
