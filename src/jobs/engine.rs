use super::actions::{CompletionProvider, Reindexer};
use super::runner::JobRunner;
use super::store::JobStore;
use super::{JobMeta, JobStatus, JobType, RunRecord, ScheduleSpec, Scheduler, scheduler};
use crate::audit::AuditLog;
use crate::audit_fields;
use crate::config::Config;
use crate::error::{JobError, Result};
use crate::plugins::PluginRegistry;
use crate::sandbox::SandboxExecutor;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// How a cancel request was honored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The timer was disarmed before firing; the job is cancelled now.
    Cancelled,
    /// A run is already in flight; it will stop at its next checkpoint.
    CancelRequested,
}

/// Facade over the job subsystem: store, scheduler and runner wired to one
/// fire channel. `start` spawns the dispatcher that turns fired job ids into
/// runner executions.
pub struct JobEngine {
    store: Arc<JobStore>,
    scheduler: Arc<Scheduler>,
    runner: Arc<JobRunner>,
    audit: Arc<AuditLog>,
    recent_runs_limit: usize,
    fire_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
}

impl JobEngine {
    pub fn new(
        config: &Config,
        registry: Arc<PluginRegistry>,
        executor: Arc<SandboxExecutor>,
        audit: Arc<AuditLog>,
        completion: Arc<dyn CompletionProvider>,
        reindexer: Arc<dyn Reindexer>,
    ) -> Self {
        let (fire_tx, fire_rx) = mpsc::unbounded_channel();
        let store = Arc::new(JobStore::new());
        let scheduler = Arc::new(Scheduler::new(fire_tx));
        let runner = Arc::new(JobRunner::new(
            config,
            Arc::clone(&store),
            Arc::clone(&scheduler),
            registry,
            executor,
            Arc::clone(&audit),
            completion,
            reindexer,
        ));

        Self {
            store,
            scheduler,
            runner,
            audit,
            recent_runs_limit: config.jobs.recent_runs_limit,
            fire_rx: Mutex::new(Some(fire_rx)),
        }
    }

    /// Spawn the dispatcher loop. Call once, after the tokio runtime is up.
    pub fn start(&self) {
        let Some(mut fire_rx) = self
            .fire_rx
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
        else {
            return;
        };
        let runner = Arc::clone(&self.runner);
        tokio::spawn(async move {
            while let Some(id) = fire_rx.recv().await {
                tokio::spawn(Arc::clone(&runner).execute(id));
            }
        });
    }

    // ── Job management ───────────────────────────────────────────

    /// Register a job and arm its trigger. Returns the stored job.
    pub fn add_job(
        &self,
        name: &str,
        job_type: JobType,
        schedule: ScheduleSpec,
        params: Map<String, Value>,
        description: Option<String>,
        tag: Option<String>,
    ) -> Result<JobMeta> {
        // Validate the trigger before anything is stored.
        scheduler::next_fire(&schedule, Utc::now())?;

        let id = new_job_id();
        let mut job = JobMeta::new(id.clone(), name.to_string(), job_type, schedule, params);
        job.description = description;
        job.tag = tag;
        self.store.insert(job.clone());
        let next_run = self.scheduler.schedule(&id, &job.schedule)?;

        self.audit.record(
            "job.scheduled",
            audit_fields! {
                "job_id" => id.as_str(),
                "job" => name,
                "job_type" => job_type.as_ref(),
                "description" => job.description.as_deref(),
                "tag" => job.tag.as_deref(),
                "next_run" => next_run.to_rfc3339(),
            },
        );
        Ok(job)
    }

    /// Replace a job's trigger, params, description or tag, re-arming the
    /// timer. `None` leaves a field unchanged.
    pub fn update_job(
        &self,
        id: &str,
        schedule: Option<ScheduleSpec>,
        params: Option<Map<String, Value>>,
        description: Option<String>,
        tag: Option<String>,
    ) -> Result<JobMeta> {
        if let Some(spec) = &schedule {
            scheduler::next_fire(spec, Utc::now())?;
        }

        let job = self.store.update(id, |j| {
            if let Some(spec) = schedule {
                j.schedule = spec;
            }
            if let Some(params) = params {
                j.params = params;
            }
            if let Some(description) = description {
                j.description = Some(description);
            }
            if let Some(tag) = tag {
                j.tag = Some(tag);
            }
        })?;
        let next_run = self.scheduler.schedule(id, &job.schedule)?;

        self.audit.record(
            "job.updated",
            audit_fields! {
                "job_id" => id,
                "next_run" => next_run.to_rfc3339(),
            },
        );
        Ok(job)
    }

    /// Disarm and drop a job. An in-flight run stops at its next checkpoint.
    pub fn remove_job(&self, id: &str) -> Result<()> {
        self.scheduler.unschedule(id);
        let removed = self
            .store
            .remove(id)
            .ok_or_else(|| JobError::NotFound { id: id.to_string() })?;
        // The cancel token must outlive the metadata; the in-flight run
        // clears it once it stops at a checkpoint.
        if removed.status == JobStatus::Running {
            self.store.request_cancel(id);
        } else {
            self.store.clear_cancel(id);
        }
        self.audit
            .record("job.removed", audit_fields! { "job_id" => id });
        Ok(())
    }

    /// Fire a job outside its schedule. Unknown ids are tolerated: the
    /// return value says whether anything ran.
    pub fn run_now(&self, id: &str) -> bool {
        if !self.store.contains(id) {
            tracing::warn!(job_id = %id, "run_now: job not found");
            return false;
        }
        self.audit
            .record("job.run_now", audit_fields! { "job_id" => id });
        tokio::spawn(Arc::clone(&self.runner).execute(id.to_string()));
        true
    }

    /// Cancel a job's next run.
    ///
    /// If the timer is still armed this is synchronous; otherwise the run is
    /// already in flight and cancellation is cooperative.
    pub fn cancel_job(&self, id: &str) -> Result<CancelOutcome> {
        if !self.store.contains(id) {
            return Err(JobError::NotFound { id: id.to_string() }.into());
        }

        if self.scheduler.unschedule(id) {
            let _ = self.store.update(id, |j| {
                j.status = JobStatus::Cancelled;
                j.push_run(
                    RunRecord {
                        status: JobStatus::Cancelled,
                        timestamp: Utc::now(),
                        detail: Some("cancelled before firing".into()),
                        attempts: j.attempts,
                    },
                    self.recent_runs_limit,
                );
            });
            self.audit
                .record("job.cancelled", audit_fields! { "job_id" => id });
            Ok(CancelOutcome::Cancelled)
        } else {
            self.store.request_cancel(id);
            self.audit
                .record("job.cancel_requested", audit_fields! { "job_id" => id });
            Ok(CancelOutcome::CancelRequested)
        }
    }

    // ── Queries ──────────────────────────────────────────────────

    pub fn list_jobs(&self) -> Vec<JobMeta> {
        self.store.list()
    }

    pub fn get_job(&self, id: &str) -> Result<JobMeta> {
        self.store
            .get(id)
            .ok_or_else(|| JobError::NotFound { id: id.to_string() }.into())
    }

    /// Most recent runs, newest first.
    pub fn recent_runs(&self, id: &str, limit: usize) -> Result<Vec<RunRecord>> {
        let job = self.get_job(id)?;
        Ok(job.recent_runs.iter().rev().take(limit).cloned().collect())
    }

    pub fn next_run(&self, id: &str) -> Option<DateTime<Utc>> {
        self.scheduler.next_run(id)
    }
}

/// Short unique job id: the first 12 hex characters of a v4 uuid.
fn new_job_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..12].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_ids_are_short_and_unique() {
        let a = new_job_id();
        let b = new_job_id();
        assert_eq!(a.len(), 12);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }
}
