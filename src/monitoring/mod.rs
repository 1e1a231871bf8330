//! Monitoring Module
//!
//! Lifecycle tracking for running jobs.
//!
//! # Components
//!
//! - [`ExecutionTimeline`]: job and thread start/end times, breakpoint
//!   hits and raised signals

pub mod timeline;

pub use timeline::{EventType, ExecutionTimeline, TimelineEvent};
