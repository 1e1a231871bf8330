//! Worker Pool
//!
//! A fixed set of OS threads pulling runnable logical threads off one
//! shared FIFO queue. A logical thread is only ever queued on its
//! transition to Runnable, so no two workers run the same one at once.
//!
//! ```text
//! schedule() --> [ queue ] --> worker 1 --> LogicalThread::run()
//!                          --> worker 2
//!                          --> ...
//! ```

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, error, info, warn};
use parking_lot::Mutex;

use super::thread::LogicalThread;
use crate::config::MIN_WORKERS;

enum WorkItem {
    Run(Arc<LogicalThread>),
    Shutdown,
}

/// Counters shared by all workers.
#[derive(Debug, Default)]
struct PoolStats {
    runs: AtomicU64,
    panics: AtomicU64,
}

/// Fixed-size pool of physical workers.
pub struct WorkerPool {
    sender: Sender<WorkItem>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    size: usize,
    stats: Arc<PoolStats>,
    shut_down: AtomicBool,
}

impl WorkerPool {
    /// Starts `size` workers (never fewer than [`MIN_WORKERS`]).
    pub fn new(size: usize) -> Arc<Self> {
        let size = size.max(MIN_WORKERS);
        let (sender, receiver) = unbounded();
        let stats = Arc::new(PoolStats::default());

        let workers = (0..size)
            .map(|index| {
                let receiver = receiver.clone();
                let stats = Arc::clone(&stats);
                thread::Builder::new()
                    .name(format!("flowrunner-worker-{}", index))
                    .spawn(move || worker_loop(index, receiver, stats))
            })
            .filter_map(|spawned| match spawned {
                Ok(handle) => Some(handle),
                Err(e) => {
                    error!("Failed to start worker: {}", e);
                    None
                }
            })
            .collect::<Vec<_>>();

        info!("Worker pool started with {} workers", workers.len());
        Arc::new(Self {
            sender,
            size: workers.len(),
            workers: Mutex::new(workers),
            stats,
            shut_down: AtomicBool::new(false),
        })
    }

    /// Number of workers.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Logical threads waiting for a worker.
    pub fn queued(&self) -> usize {
        self.sender.len()
    }

    /// Total `run()` calls made by all workers.
    pub fn runs(&self) -> u64 {
        self.stats.runs.load(Ordering::Relaxed)
    }

    /// Runs that ended in a panic.
    pub fn panics(&self) -> u64 {
        self.stats.panics.load(Ordering::Relaxed)
    }

    /// Queues a runnable thread.
    pub fn add(&self, thread: Arc<LogicalThread>) {
        if self.shut_down.load(Ordering::Acquire) {
            warn!("Worker pool is shut down; dropping thread {}", thread.id());
            return;
        }
        if let Err(e) = self.sender.send(WorkItem::Run(thread)) {
            warn!("Failed to queue thread: {}", e);
        }
    }

    /// Stops every worker after the items already queued, and waits.
    pub fn shutdown(&self) {
        self.signal_shutdown();
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if worker.join().is_err() {
                error!("Worker exited with a panic");
            }
        }
        info!("Worker pool stopped");
    }

    fn signal_shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        for _ in 0..self.size {
            let _ = self.sender.send(WorkItem::Shutdown);
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Joining here could run on a worker thread; only signal.
        self.signal_shutdown();
    }
}

fn worker_loop(index: usize, receiver: Receiver<WorkItem>, stats: Arc<PoolStats>) {
    debug!("Worker {} started", index);
    while let Ok(item) = receiver.recv() {
        let thread = match item {
            WorkItem::Run(thread) => thread,
            WorkItem::Shutdown => break,
        };

        stats.runs.fetch_add(1, Ordering::Relaxed);
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| thread.run())) {
            stats.panics.fetch_add(1, Ordering::Relaxed);
            let reason = panic_message(payload.as_ref());
            thread.force_complete(&format!("panic during step: {}", reason));
        }
    }
    debug!("Worker {} stopped", index);
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimum_size() {
        let pool = WorkerPool::new(0);
        assert_eq!(pool.size(), MIN_WORKERS);
        pool.shutdown();
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let pool = WorkerPool::new(3);
        assert_eq!(pool.size(), 3);
        pool.shutdown();
        pool.shutdown();
        assert_eq!(pool.queued(), 0);
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
        let payload: Box<dyn Any + Send> = Box::new(3);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic");
    }
}
