//! Embedded Scripting Contract
//!
//! The engine treats the scripting runtime as an injected capability:
//! compile once, evaluate many times, and read/write named values.
//! Nothing else about the runtime's object model is assumed.
//!
//! - [`ScriptContext`]: the narrow interface the scheduler consumes
//! - [`VariableContext`]: a named-value store with a tiny expression
//!   language, used by default and in tests

pub mod context;

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

pub use context::VariableContext;

/// Variable holding a function's (and ultimately the job's) return value.
pub const RESULT_VAR: &str = "RESULT";

/// Variable holding the return code of the last remote command.
pub const RC_VAR: &str = "RC";

/// Variable holding the evaluated arguments of the current function call.
pub const ARGS_VAR: &str = "ARGS";

/// Variable holding the message attached to the most recent signal.
pub const SIGNAL_MESSAGE_VAR: &str = "SIGNAL_MESSAGE";

/// Job metadata seeded into the root thread's context at start.
pub const JOB_ID_VAR: &str = "JOB_ID";
pub const JOB_NAME_VAR: &str = "JOB_NAME";
pub const START_FUNCTION_VAR: &str = "START_FUNCTION";

/// How a piece of code is compiled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompileMode {
    /// A single expression producing a value.
    Eval,
    /// A sequence of statements; the value is that of the last one.
    Exec,
}

/// Errors raised by a scripting runtime.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ScriptError {
    #[error("syntax error in '{code}': {message}")]
    Syntax { code: String, message: String },

    #[error("name '{0}' is not defined")]
    UndefinedName(String),

    #[error("unsupported operand types for {op}: {left} and {right}")]
    TypeMismatch {
        op: char,
        left: String,
        right: String,
    },

    #[error("integer overflow in {op}")]
    Overflow { op: char },

    #[error("compiled form was produced by a different scripting runtime")]
    ForeignScript,
}

/// Opaque compiled form handed back by [`ScriptContext::compile`].
///
/// Each runtime stores its own representation in `form` and downcasts it
/// again when evaluating.
#[derive(Clone)]
pub struct CompiledScript {
    code: Arc<str>,
    mode: CompileMode,
    form: Arc<dyn Any + Send + Sync>,
}

impl CompiledScript {
    /// Wraps a runtime-specific compiled form.
    pub fn new(code: &str, mode: CompileMode, form: Arc<dyn Any + Send + Sync>) -> Self {
        Self {
            code: Arc::from(code),
            mode,
            form,
        }
    }

    /// Source text this script was compiled from.
    pub fn code(&self) -> &str {
        &self.code
    }

    /// Mode the script was compiled in.
    pub fn mode(&self) -> CompileMode {
        self.mode
    }

    /// Runtime-specific compiled form.
    pub fn form(&self) -> &(dyn Any + Send + Sync) {
        self.form.as_ref()
    }
}

impl fmt::Debug for CompiledScript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledScript")
            .field("code", &self.code)
            .field("mode", &self.mode)
            .finish()
    }
}

/// Scripting sub-context attached to a logical thread.
///
/// Implementations use interior mutability: a context may be shared by a
/// parent and its children, and is accessed from whichever worker is
/// currently running one of them.
pub trait ScriptContext: Send + Sync {
    /// Compiles `code`; implementations are expected to cache the result.
    fn compile(&self, code: &str, mode: CompileMode) -> Result<CompiledScript, ScriptError>;

    /// Evaluates a previously compiled script.
    fn eval(&self, script: &CompiledScript) -> Result<Value, ScriptError>;

    /// Binds `name` to `value`.
    fn set(&self, name: &str, value: Value);

    /// Reads the value bound to `name`.
    fn get(&self, name: &str) -> Option<Value>;

    /// Every name currently bound, in name order.
    fn locals(&self) -> BTreeMap<String, Value>;

    /// Independent copy of this context, used when spawning a child thread
    /// that must not share its parent's variables.
    fn fork(&self) -> Arc<dyn ScriptContext>;

    /// Compiles and evaluates `code` in one call.
    fn run(&self, code: &str, mode: CompileMode) -> Result<Value, ScriptError> {
        let script = self.compile(code, mode)?;
        self.eval(&script)
    }
}
