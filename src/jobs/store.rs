use super::JobMeta;
use crate::error::JobError;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

/// In-memory job table plus cancellation tokens.
///
/// Cancellation is cooperative: `request_cancel` flips a token that running
/// executions check at their checkpoints. Tokens are created lazily so a
/// cancel that lands before the run starts is still seen.
#[derive(Debug, Default)]
pub struct JobStore {
    jobs: Mutex<HashMap<String, JobMeta>>,
    cancels: Mutex<HashMap<String, CancellationToken>>,
}

impl JobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_jobs(&self) -> MutexGuard<'_, HashMap<String, JobMeta>> {
        self.jobs
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn lock_cancels(&self) -> MutexGuard<'_, HashMap<String, CancellationToken>> {
        self.cancels
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn insert(&self, job: JobMeta) {
        self.lock_jobs().insert(job.id.clone(), job);
    }

    pub fn get(&self, id: &str) -> Option<JobMeta> {
        self.lock_jobs().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock_jobs().contains_key(id)
    }

    /// All jobs, oldest first.
    pub fn list(&self) -> Vec<JobMeta> {
        let mut jobs: Vec<JobMeta> = self.lock_jobs().values().cloned().collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        jobs
    }

    /// Drops the metadata only. Any cancel token stays behind so a run
    /// still in flight can see the request; the runner clears it.
    pub fn remove(&self, id: &str) -> Option<JobMeta> {
        self.lock_jobs().remove(id)
    }

    /// Mutate a job in place under the table lock.
    pub fn update(
        &self,
        id: &str,
        apply: impl FnOnce(&mut JobMeta),
    ) -> Result<JobMeta, JobError> {
        let mut jobs = self.lock_jobs();
        let job = jobs.get_mut(id).ok_or_else(|| JobError::NotFound {
            id: id.to_string(),
        })?;
        apply(job);
        Ok(job.clone())
    }

    // ── Cooperative cancellation ─────────────────────────────────

    pub fn request_cancel(&self, id: &str) {
        self.lock_cancels()
            .entry(id.to_string())
            .or_default()
            .cancel();
    }

    pub fn cancel_requested(&self, id: &str) -> bool {
        self.lock_cancels()
            .get(id)
            .is_some_and(CancellationToken::is_cancelled)
    }

    /// Drop the token once a run has fully settled, so the next run of the
    /// same job starts clean.
    pub fn clear_cancel(&self, id: &str) {
        self.lock_cancels().remove(id);
    }
}
