//! Workflow Execution Module
//!
//! Cooperative scheduling of logical threads on a bounded worker pool,
//! with priority-ordered conditions, named signals and breakpoints.
//!
//! # Architecture
//!
//! - [`condition`]: Conditions and their priority-ordered set
//! - [`thread`]: Logical threads and the run loop
//! - [`pool`]: Physical workers
//! - [`job`]: Job lifecycle, thread table and result assembly
//! - [`signals`]: Well-known signals and default handlers
//! - [`breakpoint`]: Breakpoint matching and the suspension wrapper
//! - [`result`]: Completion status and persisted results
//! - [`registry`]: Live jobs by id
//! - [`engine`]: Facade used by the service layer

pub mod breakpoint;
pub mod condition;
pub mod engine;
pub mod job;
pub mod pool;
pub mod registry;
pub mod result;
pub mod signals;
pub mod thread;

#[cfg(test)]
mod testing;

pub use breakpoint::{Breakpoint, BreakpointAction, BreakpointTable};
pub use condition::{Condition, ConditionKind, ConditionSet, HoldReason};
pub use engine::{Engine, JobRequest, LOCAL_MACHINE};
pub use job::{Job, JobListener, JobOptions, JobState, ROOT_THREAD_ID};
pub use pool::WorkerPool;
pub use registry::JobRegistry;
pub use result::{
    CompletionStatus, JobDetail, JobLogEntry, JobOutcome, JobSummary, ResultStore, TestcaseOutcome,
};
pub use signals::SignalPolicy;
pub use thread::{LogicalThread, ThreadSnapshot, ThreadState, FAIRNESS_CEILING};
