//! Job Registry
//!
//! Live jobs by id. A job removes itself when its last thread completes;
//! results of removed jobs remain available through the result store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;

use super::job::Job;
use crate::error::{EngineError, Result};

pub struct JobRegistry {
    next_id: AtomicU64,
    jobs: Mutex<HashMap<u64, Arc<Job>>>,
}

impl JobRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicU64::new(1),
            jobs: Mutex::new(HashMap::new()),
        })
    }

    /// Next unused job id.
    pub fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Registers `job`; it removes itself on completion.
    pub fn insert(self: &Arc<Self>, job: &Arc<Job>) {
        job.attach_registry(Arc::downgrade(self));
        self.jobs.lock().insert(job.id(), Arc::clone(job));
        debug!("Registered job {}", job.id());
    }

    pub fn get(&self, id: u64) -> Result<Arc<Job>> {
        self.jobs
            .lock()
            .get(&id)
            .cloned()
            .ok_or(EngineError::JobNotFound(id))
    }

    /// Removes `id`; only the first call for a given id returns the job.
    pub fn remove(&self, id: u64) -> Option<Arc<Job>> {
        let removed = self.jobs.lock().remove(&id);
        if removed.is_some() {
            debug!("Removed job {} from the registry", id);
        }
        removed
    }

    pub fn contains(&self, id: u64) -> bool {
        self.jobs.lock().contains_key(&id)
    }

    /// Ids of live jobs in ascending order.
    pub fn ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.jobs.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::job::JobOptions;
    use crate::execution::result::CompletionStatus;
    use crate::execution::testing::{document, pending_job};
    use crate::workflow::ScriptAction;

    #[test]
    fn test_allocate_ids() {
        let registry = JobRegistry::new();
        assert_eq!(registry.allocate_id(), 1);
        assert_eq!(registry.allocate_id(), 2);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_remove_once() {
        let registry = JobRegistry::new();
        let job = pending_job(document(ScriptAction::new("x = 1")), JobOptions::default());
        registry.insert(&job);

        assert!(registry.contains(1));
        assert_eq!(registry.ids(), vec![1]);
        assert_eq!(registry.get(1).unwrap().id(), 1);

        assert!(registry.remove(1).is_some());
        assert!(registry.remove(1).is_none());
        assert!(matches!(registry.get(1), Err(EngineError::JobNotFound(1))));
    }

    #[test]
    fn test_completed_job_leaves() {
        let registry = JobRegistry::new();
        let job = pending_job(document(ScriptAction::new("x = 1")), JobOptions::default());
        registry.insert(&job);

        job.cleanup_pending_job(CompletionStatus::Normal, "test mode")
            .unwrap();
        assert!(registry.is_empty());
    }
}
