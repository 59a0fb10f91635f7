//! End-to-end job engine tests: real timers, real dispatcher, real sandbox.

use hestia::audit::AuditLog;
use hestia::config::Config;
use hestia::jobs::actions::{NoopReindexer, OfflineCompletion};
use hestia::jobs::{CancelOutcome, JobEngine, JobMeta, JobStatus, JobType, ScheduleSpec};
use hestia::observability::PluginMetrics;
use hestia::plugins::PluginRegistry;
use hestia::sandbox::SandboxExecutor;
use serde_json::{Map, json};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn engine(tmp: &TempDir, mutate: impl FnOnce(&mut Config)) -> (JobEngine, Config) {
    let mut config = Config::default();
    config.workspace_dir = tmp.path().join("workspace");
    mutate(&mut config);

    let audit = Arc::new(AuditLog::new(config.audit_log_path()));
    let registry = Arc::new(PluginRegistry::new(
        Arc::clone(&audit),
        config.plugin_log_dir(),
    ));
    registry.load(&config.plugin_roots()).unwrap();
    let executor = Arc::new(SandboxExecutor::new(
        Arc::clone(&registry),
        Arc::new(PluginMetrics::new()),
        Arc::clone(&audit),
        &config,
    ));
    let engine = JobEngine::new(
        &config,
        registry,
        executor,
        audit,
        Arc::new(OfflineCompletion),
        Arc::new(NoopReindexer),
    );
    engine.start();
    (engine, config)
}

async fn wait_for_status(engine: &JobEngine, id: &str, wanted: JobStatus) -> JobMeta {
    for _ in 0..200 {
        let job = engine.get_job(id).unwrap();
        if job.status == wanted {
            return job;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("job {id} never reached {wanted}");
}

fn llm_params(prompt: &str) -> Map<String, serde_json::Value> {
    let mut params = Map::new();
    params.insert("prompt".into(), json!(prompt));
    params
}

#[tokio::test]
async fn immediate_llm_job_runs_to_success() {
    let tmp = TempDir::new().unwrap();
    let (engine, config) = engine(&tmp, |_| {});

    let job = engine
        .add_job(
            "morning-brief",
            JobType::Llm,
            ScheduleSpec::Immediate,
            llm_params("summarize my day"),
            None,
            None,
        )
        .unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.id.len(), 12);

    let done = wait_for_status(&engine, &job.id, JobStatus::Success).await;
    assert_eq!(done.attempts, 0);
    assert_eq!(done.recent_runs.len(), 1);
    assert!(done.last_run_at.is_some());

    // llm jobs leave a prompt log entry behind
    let prompts = std::fs::read_to_string(config.prompt_log_path()).unwrap();
    assert!(prompts.contains("summarize my day"));
}

#[tokio::test]
async fn failing_job_exhausts_retry_budget() {
    let tmp = TempDir::new().unwrap();
    let (engine, config) = engine(&tmp, |c| c.jobs.retry_delays_secs = vec![0, 0, 0]);

    // Missing 'prompt' param makes every attempt fail.
    let job = engine
        .add_job("broken", JobType::Llm, ScheduleSpec::Immediate, Map::new(), None, None)
        .unwrap();

    let failed = wait_for_status(&engine, &job.id, JobStatus::Failed).await;
    assert_eq!(failed.attempts, 4);
    assert!(failed.last_error.as_deref().unwrap().contains("prompt"));
    assert!(failed.last_error_at.is_some());
    let statuses: Vec<JobStatus> = failed.recent_runs.iter().map(|r| r.status).collect();
    assert_eq!(
        statuses,
        vec![
            JobStatus::Retrying,
            JobStatus::Retrying,
            JobStatus::Retrying,
            JobStatus::Failed
        ]
    );

    let events = std::fs::read_to_string(config.audit_log_path()).unwrap();
    assert!(events.contains("\"will_retry\":true"));
    assert!(events.contains("\"will_retry\":false"));
}

#[tokio::test]
async fn cancel_before_fire_is_synchronous() {
    let tmp = TempDir::new().unwrap();
    let (engine, _config) = engine(&tmp, |_| {});

    let at = chrono::Utc::now() + chrono::Duration::hours(1);
    let job = engine
        .add_job(
            "later",
            JobType::Llm,
            ScheduleSpec::Date { at },
            llm_params("never sent"),
            None,
            None,
        )
        .unwrap();
    assert!(engine.next_run(&job.id).is_some());

    let outcome = engine.cancel_job(&job.id).unwrap();
    assert_eq!(outcome, CancelOutcome::Cancelled);
    assert_eq!(engine.get_job(&job.id).unwrap().status, JobStatus::Cancelled);
    assert!(engine.next_run(&job.id).is_none());
}

#[tokio::test]
async fn run_now_fires_off_schedule() {
    let tmp = TempDir::new().unwrap();
    let (engine, _config) = engine(&tmp, |_| {});

    let at = chrono::Utc::now() + chrono::Duration::hours(1);
    let job = engine
        .add_job(
            "later",
            JobType::Llm,
            ScheduleSpec::Date { at },
            llm_params("bring it forward"),
            None,
            None,
        )
        .unwrap();

    assert!(engine.run_now(&job.id));
    let done = wait_for_status(&engine, &job.id, JobStatus::Success).await;
    assert_eq!(done.recent_runs.len(), 1);
    // The original timer is still armed for the scheduled instant.
    assert!(engine.next_run(&job.id).is_some());
}

#[tokio::test]
async fn run_now_unknown_id_is_tolerated() {
    let tmp = TempDir::new().unwrap();
    let (engine, _config) = engine(&tmp, |_| {});
    assert!(!engine.run_now("nosuchjob"));
}

#[tokio::test]
async fn interval_job_runs_repeatedly() {
    let tmp = TempDir::new().unwrap();
    let (engine, _config) = engine(&tmp, |_| {});

    let job = engine
        .add_job(
            "tick",
            JobType::Llm,
            ScheduleSpec::Interval { secs: 1 },
            llm_params("tick"),
            None,
            None,
        )
        .unwrap();

    for _ in 0..200 {
        if engine.get_job(&job.id).unwrap().recent_runs.len() >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let job = engine.get_job(&job.id).unwrap();
    assert!(job.recent_runs.len() >= 2);
    assert!(engine.next_run(&job.id).is_some());
}

#[tokio::test]
async fn transient_failure_keeps_the_interval_schedule() {
    let tmp = TempDir::new().unwrap();
    let (engine, _config) = engine(&tmp, |c| c.jobs.retry_delays_secs = vec![1]);

    // Missing 'prompt' param makes every attempt fail.
    let job = engine
        .add_job(
            "flaky",
            JobType::Llm,
            ScheduleSpec::Interval { secs: 1 },
            Map::new(),
            None,
            None,
        )
        .unwrap();

    wait_for_status(&engine, &job.id, JobStatus::Retrying).await;
    // Arming the retry must not displace the recurring trigger.
    assert!(engine.next_run(&job.id).is_some());

    // The interval keeps firing past the retry cycle.
    for _ in 0..200 {
        if engine.get_job(&job.id).unwrap().failure_count >= 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let job = engine.get_job(&job.id).unwrap();
    assert!(job.failure_count >= 3);
    assert!(engine.next_run(&job.id).is_some());
}

#[tokio::test]
async fn description_and_tag_round_trip() {
    let tmp = TempDir::new().unwrap();
    let (engine, config) = engine(&tmp, |_| {});

    let at = chrono::Utc::now() + chrono::Duration::hours(1);
    let job = engine
        .add_job(
            "digest",
            JobType::Llm,
            ScheduleSpec::Date { at },
            llm_params("daily digest"),
            Some("summarize the day's notes".into()),
            Some("briefing".into()),
        )
        .unwrap();
    assert_eq!(job.description.as_deref(), Some("summarize the day's notes"));
    assert_eq!(job.tag.as_deref(), Some("briefing"));

    let updated = engine
        .update_job(&job.id, None, None, None, Some("ops".into()))
        .unwrap();
    assert_eq!(updated.tag.as_deref(), Some("ops"));
    assert_eq!(
        updated.description.as_deref(),
        Some("summarize the day's notes")
    );

    let events = std::fs::read_to_string(config.audit_log_path()).unwrap();
    assert!(events.contains("\"tag\":\"briefing\""));
}

#[tokio::test]
async fn plugin_job_round_trips_through_the_sandbox() {
    let tmp = TempDir::new().unwrap();
    let (engine, _config) = engine(&tmp, |_| {});

    let mut params = Map::new();
    params.insert("plugin".into(), json!("tasks"));
    params.insert("args".into(), json!({"action": "add", "title": "stretch"}));
    let job = engine
        .add_job("add-task", JobType::Plugin, ScheduleSpec::Immediate, params, None, None)
        .unwrap();

    let done = wait_for_status(&engine, &job.id, JobStatus::Success).await;
    let detail = done.recent_runs[0].detail.as_deref().unwrap();
    assert!(detail.contains("stretch"));
}

#[tokio::test]
async fn backup_job_produces_an_archive() {
    let tmp = TempDir::new().unwrap();
    let (engine, config) = engine(&tmp, |_| {});
    std::fs::create_dir_all(config.db_path().parent().unwrap()).unwrap();
    std::fs::write(config.db_path(), b"history").unwrap();

    let job = engine
        .add_job("nightly", JobType::Backup, ScheduleSpec::Immediate, Map::new(), None, None)
        .unwrap();
    wait_for_status(&engine, &job.id, JobStatus::Success).await;

    let archives: Vec<_> = std::fs::read_dir(config.backup_dir())
        .unwrap()
        .flatten()
        .collect();
    assert_eq!(archives.len(), 1);
}

#[tokio::test]
async fn update_job_rearms_the_trigger() {
    let tmp = TempDir::new().unwrap();
    let (engine, _config) = engine(&tmp, |_| {});

    let at = chrono::Utc::now() + chrono::Duration::hours(1);
    let job = engine
        .add_job(
            "movable",
            JobType::Llm,
            ScheduleSpec::Date { at },
            llm_params("old"),
            None,
            None,
        )
        .unwrap();
    let first = engine.next_run(&job.id).unwrap();

    let later = chrono::Utc::now() + chrono::Duration::hours(2);
    let updated = engine
        .update_job(
            &job.id,
            Some(ScheduleSpec::Date { at: later }),
            Some(llm_params("new")),
            None,
            None,
        )
        .unwrap();
    assert_eq!(updated.params["prompt"], json!("new"));
    assert!(engine.next_run(&job.id).unwrap() > first);
}

#[tokio::test]
async fn remove_job_disarms_and_forgets() {
    let tmp = TempDir::new().unwrap();
    let (engine, config) = engine(&tmp, |_| {});

    let at = chrono::Utc::now() + chrono::Duration::hours(1);
    let job = engine
        .add_job(
            "doomed",
            JobType::Llm,
            ScheduleSpec::Date { at },
            llm_params("never"),
            None,
            None,
        )
        .unwrap();

    engine.remove_job(&job.id).unwrap();
    assert!(engine.get_job(&job.id).is_err());
    assert!(engine.next_run(&job.id).is_none());
    assert!(engine.remove_job(&job.id).is_err());

    let events = std::fs::read_to_string(config.audit_log_path()).unwrap();
    assert!(events.contains("job.removed"));
}

#[tokio::test]
async fn invalid_trigger_is_rejected_before_storing() {
    let tmp = TempDir::new().unwrap();
    let (engine, _config) = engine(&tmp, |_| {});

    let err = engine
        .add_job(
            "bad",
            JobType::Llm,
            ScheduleSpec::Interval { secs: 0 },
            llm_params("x"),
            None,
            None,
        )
        .unwrap_err();
    assert!(err.to_string().contains("positive"));
    assert!(engine.list_jobs().is_empty());

    let err = engine
        .add_job(
            "bad-cron",
            JobType::Llm,
            ScheduleSpec::Cron {
                hour: 25,
                minute: 0,
                day_of_week: None,
            },
            llm_params("x"),
            None,
            None,
        )
        .unwrap_err();
    assert!(err.to_string().contains("out of range"));
}
