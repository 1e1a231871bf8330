//! Workflow Definition Module
//!
//! Data structures for parsed workflow documents and the actions they are
//! made of.
//!
//! # Structure
//!
//! - [`action`]: The [`Action`] contract the scheduler consumes
//! - [`actions`]: Built-in action kinds
//! - [`document`]: Documents, function tables and document specs
//! - [`registry`]: Kind tag to factory mapping

pub mod action;
pub mod actions;
pub mod document;
pub mod registry;

pub use action::{Action, ActionHandle, SourceLocation};
pub use actions::{
    CallAction, CommandAction, RaiseAction, ScriptAction, SequenceAction, SpawnAction,
    TerminateAction, TerminateScope,
};
pub use document::{load_document, Document, DocumentSpec, FunctionDef, FunctionSpec};
pub use registry::{ActionFactory, ActionRegistry, ActionSpec};
