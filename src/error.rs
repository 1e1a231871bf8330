//! Engine Error Types
//!
//! A single error enum shared by the scheduler, the caches and the
//! surrounding service layer.

use std::io;

use crate::script::ScriptError;

/// Errors surfaced by the execution engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Job {0} not found")]
    JobNotFound(u64),

    #[error("Thread {thread} not found in job {job}")]
    ThreadNotFound { job: u64, thread: u64 },

    #[error("Breakpoint {0} not found")]
    BreakpointNotFound(u64),

    #[error("Job {job} reached its limit of {limit} concurrent child threads")]
    ThreadLimitExceeded { job: u64, limit: usize },

    #[error("Invalid start function '{0}'")]
    InvalidStartFunction(String),

    #[error("No start function specified and the document declares no default")]
    MissingStartFunction,

    #[error("Job {0} has already been started")]
    AlreadyStarted(u64),

    #[error("Thread {0} is not held")]
    ThreadNotHeld(u64),

    #[error("Unknown action kind '{0}'")]
    UnknownActionKind(String),

    #[error("Invalid '{kind}' action: {message}")]
    InvalidAction { kind: String, message: String },

    #[error("Failed to fetch '{path}' from {machine}: {message}")]
    FetchFailed {
        machine: String,
        path: String,
        message: String,
    },

    #[error("Remote command to {service} on {machine} failed with RC {code}: {message}")]
    RemoteCommand {
        machine: String,
        service: String,
        code: i32,
        message: String,
    },

    #[error("No result recorded for job {0}")]
    ResultNotFound(u64),

    #[error("Script error: {0}")]
    Script(#[from] ScriptError),

    #[error("Configuration error: {0}")]
    Config(#[from] serde_yaml::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, EngineError>;
