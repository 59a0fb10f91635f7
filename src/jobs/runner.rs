use super::actions::{BackupExporter, CompletionProvider, PromptLog, Reindexer};
use super::store::JobStore;
use super::{JobMeta, JobStatus, JobType, RunRecord, Scheduler};
use crate::audit::AuditLog;
use crate::audit_fields;
use crate::config::Config;
use crate::plugins::PluginRegistry;
use crate::sandbox::SandboxExecutor;
use anyhow::Context;
use chrono::Utc;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

const DETAIL_LIMIT: usize = 500;

/// Executes one fired job: dispatch by type, retry with a bounded backoff
/// budget, honor cooperative cancellation.
pub struct JobRunner {
    store: Arc<JobStore>,
    scheduler: Arc<Scheduler>,
    registry: Arc<PluginRegistry>,
    executor: Arc<SandboxExecutor>,
    audit: Arc<AuditLog>,
    completion: Arc<dyn CompletionProvider>,
    reindexer: Arc<dyn Reindexer>,
    backup: BackupExporter,
    prompt_log: PromptLog,
    retry_delays: Vec<u64>,
    recent_runs_limit: usize,
}

impl JobRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &Config,
        store: Arc<JobStore>,
        scheduler: Arc<Scheduler>,
        registry: Arc<PluginRegistry>,
        executor: Arc<SandboxExecutor>,
        audit: Arc<AuditLog>,
        completion: Arc<dyn CompletionProvider>,
        reindexer: Arc<dyn Reindexer>,
    ) -> Self {
        Self {
            store,
            scheduler,
            registry,
            executor,
            audit,
            completion,
            reindexer,
            backup: BackupExporter::new(config),
            prompt_log: PromptLog::new(config.prompt_log_path()),
            retry_delays: config.jobs.retry_delays_secs.clone(),
            recent_runs_limit: config.jobs.recent_runs_limit,
        }
    }

    /// Run one execution attempt for `id`.
    ///
    /// Boxed so a zero-delay retry can re-enter inline; timed retries go
    /// back through the scheduler instead.
    pub fn execute(self: Arc<Self>, id: String) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async move {
            let Some(job) = self.store.get(&id) else {
                tracing::warn!(job_id = %id, "fired job no longer exists");
                self.store.clear_cancel(&id);
                return;
            };
            if self.store.cancel_requested(&id) {
                self.finish_cancelled(&id, job.attempts);
                return;
            }

            let attempt = job.attempts + 1;
            let _ = self.store.update(&id, |j| {
                j.status = JobStatus::Running;
                j.last_run_at = Some(Utc::now());
            });
            self.audit.record(
                "job.started",
                audit_fields! {
                    "job_id" => id.as_str(),
                    "job" => job.name.as_str(),
                    "job_type" => job.job_type.as_ref(),
                    "attempt" => attempt,
                },
            );

            let started = Instant::now();
            let outcome = self.perform(&job).await;

            // A cancel that landed mid-run wins over the run's own outcome.
            if self.store.cancel_requested(&id) {
                self.finish_cancelled(&id, attempt);
                return;
            }

            match outcome {
                Ok(detail) => {
                    let detail = truncate(&detail);
                    let _ = self.store.update(&id, |j| {
                        j.status = JobStatus::Success;
                        j.attempts = 0;
                        j.success_count += 1;
                        j.last_error = None;
                        j.last_error_at = None;
                        j.push_run(
                            RunRecord {
                                status: JobStatus::Success,
                                timestamp: Utc::now(),
                                detail: Some(detail.clone()),
                                attempts: attempt,
                            },
                            self.recent_runs_limit,
                        );
                    });
                    self.audit.record(
                        "job.finished",
                        audit_fields! {
                            "job_id" => id.as_str(),
                            "duration_ms" => started.elapsed().as_millis() as u64,
                            "attempt" => attempt,
                        },
                    );
                    self.store.clear_cancel(&id);
                }
                Err(error) => {
                    let message = truncate(&format!("{error:#}"));
                    let will_retry = (attempt as usize) <= self.retry_delays.len();
                    let status = if will_retry {
                        JobStatus::Retrying
                    } else {
                        JobStatus::Failed
                    };
                    let _ = self.store.update(&id, |j| {
                        j.status = status;
                        j.attempts = attempt;
                        j.failure_count += 1;
                        j.last_error = Some(message.clone());
                        j.last_error_at = Some(Utc::now());
                        j.push_run(
                            RunRecord {
                                status,
                                timestamp: Utc::now(),
                                detail: Some(message.clone()),
                                attempts: attempt,
                            },
                            self.recent_runs_limit,
                        );
                    });

                    let retry_in = will_retry.then(|| self.retry_delays[attempt as usize - 1]);
                    self.audit.record(
                        "job.failed",
                        audit_fields! {
                            "job_id" => id.as_str(),
                            "attempt" => attempt,
                            "error" => message.as_str(),
                            "will_retry" => will_retry,
                            "retry_in_seconds" => retry_in,
                        },
                    );
                    tracing::warn!(job_id = %id, attempt, error = %message, will_retry, "job attempt failed");

                    match retry_in {
                        Some(0) => Arc::clone(&self).execute(id).await,
                        Some(delay) => {
                            self.scheduler.schedule_once(&id, Duration::from_secs(delay));
                        }
                        None => self.store.clear_cancel(&id),
                    }
                }
            }
        })
    }

    fn finish_cancelled(&self, id: &str, attempts: u32) {
        let _ = self.store.update(id, |j| {
            j.status = JobStatus::Cancelled;
            j.push_run(
                RunRecord {
                    status: JobStatus::Cancelled,
                    timestamp: Utc::now(),
                    detail: None,
                    attempts,
                },
                self.recent_runs_limit,
            );
        });
        self.audit
            .record("job.cancelled", audit_fields! { "job_id" => id });
        self.store.clear_cancel(id);
    }

    async fn perform(&self, job: &JobMeta) -> anyhow::Result<String> {
        match job.job_type {
            JobType::Plugin => {
                let name = job
                    .params
                    .get("plugin")
                    .and_then(Value::as_str)
                    .context("plugin job missing 'plugin' param")?;
                let args = job
                    .params
                    .get("args")
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_default();
                self.registry.ensure_running(name)?;
                let value = self.executor.run(name, args).await?;
                Ok(value.to_string())
            }
            JobType::Llm => {
                let prompt = job
                    .params
                    .get("prompt")
                    .and_then(Value::as_str)
                    .context("llm job missing 'prompt' param")?;
                let response = self.completion.complete(prompt).await?;
                self.prompt_log.append(&job.id, prompt, &response);
                Ok(response)
            }
            JobType::Backup => {
                let archive = self.backup.run()?;
                Ok(format!("archived to {}", archive.display()))
            }
            JobType::Rag => {
                let indexed = self.reindexer.reindex().await?;
                Ok(format!("reindexed {indexed} documents"))
            }
        }
    }
}

fn truncate(text: &str) -> String {
    if text.chars().count() <= DETAIL_LIMIT {
        text.to_string()
    } else {
        let head: String = text.chars().take(DETAIL_LIMIT).collect();
        format!("{head}…")
    }
}
