//! Execution Timeline
//!
//! Records job and logical-thread lifecycle events so that a finished job
//! can report per-thread run times and how often it stopped at
//! breakpoints or raised signals.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Type of timeline event.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    JobStarted,
    JobEnded,
    ThreadStarted,
    ThreadEnded,
    /// A thread suspended at a breakpoint or a step request
    BreakpointHit,
    /// A named signal was raised on a thread
    SignalRaised,
}

impl EventType {
    fn opens(self) -> bool {
        matches!(self, EventType::JobStarted | EventType::ThreadStarted)
    }

    fn closes(self) -> bool {
        matches!(self, EventType::JobEnded | EventType::ThreadEnded)
    }
}

/// A single event in the execution timeline.
#[derive(Debug, Clone)]
pub struct TimelineEvent {
    /// What the event is about, e.g. `job` or `thread-3`
    pub subject: String,
    pub event_type: EventType,
    /// Extra context such as the signal name
    pub detail: Option<String>,
    /// Monotonic time, used for durations
    pub timestamp: Instant,
    /// Wall-clock time, used for reports
    pub at: DateTime<Utc>,
}

/// Lifecycle events of one job.
#[derive(Debug, Clone)]
pub struct ExecutionTimeline {
    events: Vec<TimelineEvent>,
    start_time: Instant,
}

impl ExecutionTimeline {
    pub fn new() -> Self {
        Self {
            events: Vec::new(),
            start_time: Instant::now(),
        }
    }

    /// Records an event for `subject`.
    pub fn add_event(&mut self, subject: impl Into<String>, event_type: EventType) {
        self.push(subject.into(), event_type, None);
    }

    /// Records an event carrying extra detail.
    pub fn add_event_with_detail(
        &mut self,
        subject: impl Into<String>,
        event_type: EventType,
        detail: impl Into<String>,
    ) {
        self.push(subject.into(), event_type, Some(detail.into()));
    }

    fn push(&mut self, subject: String, event_type: EventType, detail: Option<String>) {
        self.events.push(TimelineEvent {
            subject,
            event_type,
            detail,
            timestamp: Instant::now(),
            at: Utc::now(),
        });
    }

    pub fn get_events(&self) -> &[TimelineEvent] {
        &self.events
    }

    /// Elapsed time since the timeline was created.
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Number of events of one type.
    pub fn count(&self, event_type: EventType) -> usize {
        self.events
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }

    /// Events recorded for one subject, in order.
    pub fn events_for<'a>(&'a self, subject: &'a str) -> impl Iterator<Item = &'a TimelineEvent> {
        self.events.iter().filter(move |e| e.subject == subject)
    }

    /// Start-to-end durations in milliseconds of every subject that both
    /// started and ended.
    pub fn get_durations(&self) -> HashMap<String, u128> {
        let mut starts: HashMap<&str, u128> = HashMap::new();
        let mut durations: HashMap<String, u128> = HashMap::new();

        for event in &self.events {
            let elapsed = event.timestamp.duration_since(self.start_time).as_millis();
            if event.event_type.opens() {
                starts.insert(&event.subject, elapsed);
            } else if event.event_type.closes() {
                if let Some(start) = starts.get(event.subject.as_str()) {
                    durations.insert(event.subject.clone(), elapsed - start);
                }
            }
        }

        durations
    }

    /// One line per event, relative to the start of the timeline.
    pub fn report(&self) -> String {
        let mut output = String::new();
        for event in &self.events {
            let offset = event.timestamp.duration_since(self.start_time).as_millis();
            output.push_str(&format!(
                "{:>8} ms  {:<10} {:?}",
                offset, event.subject, event.event_type
            ));
            if let Some(detail) = &event.detail {
                output.push_str(&format!(" ({})", detail));
            }
            output.push('\n');
        }
        output
    }
}

impl Default for ExecutionTimeline {
    fn default() -> Self {
        Self::new()
    }
}
