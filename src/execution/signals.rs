//! Well-Known Signals
//!
//! Control-flow faults are routed through named signals. Every job starts
//! with a default handler installed for each name below; a workflow can
//! rebind any of them to its own handler.

use std::collections::BTreeMap;
use std::fmt;

use log::error;
use once_cell::sync::Lazy;
use serde::Serialize;

use crate::execution::{Condition, LogicalThread};
use crate::script::SIGNAL_MESSAGE_VAR;
use crate::workflow::Action;

pub const SCRIPT_EVALUATION_ERROR: &str = "ScriptEvaluationError";
pub const COMMAND_START_ERROR: &str = "CommandStartError";
pub const COMMAND_START_TIMEOUT: &str = "CommandStartTimeout";
pub const COMMAND_FAILED: &str = "CommandFailed";
pub const FUNCTION_DOES_NOT_EXIST: &str = "FunctionDoesNotExist";
pub const FUNCTION_ARG_VALIDATION_ERROR: &str = "FunctionArgValidationError";
pub const INVALID_BLOCK_NAME: &str = "InvalidBlockName";
pub const BLOCK_DOES_NOT_EXIST: &str = "BlockDoesNotExist";
pub const INVALID_TIMER_VALUE: &str = "InvalidTimerValue";
pub const MAX_THREADS_EXCEEDED: &str = "MaxThreadsExceeded";
pub const TESTCASE_MISSING_ERROR: &str = "TestcaseMissingError";
pub const NO_SUCH_SIGNAL_HANDLER: &str = "NoSuchSignalHandler";

/// Termination code used when a default handler stops the job.
pub const SIGNAL_TERMINATE_CODE: i64 = -1;

/// Termination code of a thread that raised a signal while already
/// handling it.
pub const DUPLICATE_SIGNAL_CODE: i64 = -2;

/// What a default handler does after logging the signal.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalPolicy {
    Terminate,
    Continue,
}

impl fmt::Display for SignalPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalPolicy::Terminate => write!(f, "Terminating job"),
            SignalPolicy::Continue => write!(f, "Continuing job"),
        }
    }
}

static DEFAULT_POLICIES: Lazy<BTreeMap<&'static str, SignalPolicy>> = Lazy::new(|| {
    use SignalPolicy::*;
    BTreeMap::from([
        (SCRIPT_EVALUATION_ERROR, Terminate),
        (COMMAND_START_ERROR, Terminate),
        (COMMAND_START_TIMEOUT, Continue),
        (COMMAND_FAILED, Continue),
        (FUNCTION_DOES_NOT_EXIST, Terminate),
        (FUNCTION_ARG_VALIDATION_ERROR, Terminate),
        (INVALID_BLOCK_NAME, Terminate),
        (BLOCK_DOES_NOT_EXIST, Continue),
        (INVALID_TIMER_VALUE, Terminate),
        (MAX_THREADS_EXCEEDED, Terminate),
        (TESTCASE_MISSING_ERROR, Continue),
        (NO_SUCH_SIGNAL_HANDLER, Continue),
    ])
});

/// Default handler table in name order.
pub fn default_policies() -> impl Iterator<Item = (&'static str, SignalPolicy)> {
    DEFAULT_POLICIES.iter().map(|(name, policy)| (*name, *policy))
}

/// Default policy for `name`, if it is a well-known signal.
pub fn default_policy(name: &str) -> Option<SignalPolicy> {
    DEFAULT_POLICIES.get(name).copied()
}

/// Handler installed for every well-known signal at job start: logs the
/// signal message at error level, then applies its policy.
#[derive(Debug, Clone)]
pub struct DefaultSignalHandler {
    signal: String,
    policy: SignalPolicy,
}

impl DefaultSignalHandler {
    pub fn new(signal: impl Into<String>, policy: SignalPolicy) -> Self {
        Self {
            signal: signal.into(),
            policy,
        }
    }
}

impl Action for DefaultSignalHandler {
    fn kind(&self) -> &'static str {
        "default-signal-handler"
    }

    fn execute(&mut self, thread: &LogicalThread) {
        thread.pop_action();

        let message = thread
            .script()
            .get(SIGNAL_MESSAGE_VAR)
            .map(|value| match value {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            })
            .unwrap_or_default();
        let text = format!(
            "{} signal raised. {}. {}",
            self.signal, self.policy, message
        );

        match thread.job() {
            Some(job) => {
                job.log_error(format!("[thread {}] {}", thread.id(), text));
                if self.policy == SignalPolicy::Terminate {
                    job.terminate(SIGNAL_TERMINATE_CODE);
                }
            }
            None => {
                error!("{}", text);
                if self.policy == SignalPolicy::Terminate {
                    thread.terminate(SIGNAL_TERMINATE_CODE);
                }
            }
        }
    }

    fn clone_action(&self) -> Box<dyn Action> {
        Box::new(self.clone())
    }

    fn describe(&self) -> String {
        format!("default handler for {}", self.signal)
    }
}

/// Marks the extent of a running signal handler on the stack. Once the
/// handler above it is gone, the signal is no longer active.
#[derive(Debug, Clone)]
pub struct SignalHandlerFrame {
    signal: String,
}

impl SignalHandlerFrame {
    pub fn new(signal: impl Into<String>) -> Self {
        Self {
            signal: signal.into(),
        }
    }
}

impl Action for SignalHandlerFrame {
    fn kind(&self) -> &'static str {
        "signal-handler"
    }

    fn execute(&mut self, thread: &LogicalThread) {
        thread.pop_action();
        thread.handled_signal(&self.signal);
    }

    fn handle_condition(&mut self, thread: &LogicalThread, _condition: &Condition) {
        thread.pop_action();
        thread.handled_signal(&self.signal);
    }

    fn clone_action(&self) -> Box<dyn Action> {
        Box::new(self.clone())
    }

    fn describe(&self) -> String {
        format!("handling {}", self.signal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_table() {
        assert_eq!(default_policy(SCRIPT_EVALUATION_ERROR), Some(SignalPolicy::Terminate));
        assert_eq!(default_policy(NO_SUCH_SIGNAL_HANDLER), Some(SignalPolicy::Continue));
        assert_eq!(default_policy("Custom"), None);
        assert_eq!(default_policies().count(), 12);
    }

    #[test]
    fn test_policy_display() {
        assert_eq!(SignalPolicy::Terminate.to_string(), "Terminating job");
        assert_eq!(SignalPolicy::Continue.to_string(), "Continuing job");
    }

    #[test]
    fn test_handler_descriptions() {
        let handler = DefaultSignalHandler::new(COMMAND_FAILED, SignalPolicy::Continue);
        assert_eq!(handler.describe(), "default handler for CommandFailed");
        assert_eq!(handler.clone_action().kind(), "default-signal-handler");
        assert_eq!(SignalHandlerFrame::new("X").describe(), "handling X");
    }
}
