//! Fixtures for tests that run real jobs on a real worker pool.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use super::job::{Job, JobOptions};
use super::pool::WorkerPool;
use super::thread::{LogicalThread, ThreadState};
use crate::workflow::{Action, Document, ScriptAction, SequenceAction};

/// Upper bound on how long any scenario may take.
pub const TIMEOUT: Duration = Duration::from_secs(10);

pub fn script(code: &str) -> Arc<dyn Action> {
    Arc::new(ScriptAction::new(code))
}

pub fn sequence(children: Vec<Arc<dyn Action>>) -> SequenceAction {
    SequenceAction::new(children)
}

/// A document whose default function `main` runs `body`.
pub fn document(body: impl Action) -> Document {
    Document::new("scenario")
        .with_function("main", body)
        .with_default_function("main")
}

/// Creates a pending job on a fresh two-worker pool.
pub fn pending_job(document: Document, options: JobOptions) -> Arc<Job> {
    Job::new(1, Arc::new(document), WorkerPool::new(2), options)
}

/// Starts `document` and waits for the job to complete.
pub fn run_job(document: Document, options: JobOptions) -> Arc<Job> {
    let job = pending_job(document, options);
    job.start_execution().unwrap();
    assert!(job.wait(TIMEOUT), "job did not complete");
    job
}

/// Polls `condition` until it holds, failing the test on timeout.
pub fn wait_until<F: Fn() -> bool>(condition: F) {
    let deadline = Instant::now() + TIMEOUT;
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(5));
    }
}

/// Waits until `thread` has parked on a hold.
pub fn wait_until_held(thread: &LogicalThread) {
    wait_until(|| thread.state() == ThreadState::Blocked && thread.is_held());
}
