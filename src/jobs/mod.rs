//! Job scheduling and execution.
//!
//! A job couples a payload (`JobType` plus params) with a trigger
//! (`ScheduleSpec`). The [`scheduler`] turns triggers into timer tasks that
//! fire job ids over a channel; the [`engine`] dispatches fired ids to the
//! [`runner`], which executes the payload with a bounded retry budget and
//! cooperative cancellation. All state lives in the in-memory [`store`].

pub mod actions;
pub mod engine;
pub mod runner;
pub mod scheduler;
pub mod store;

pub use engine::{CancelOutcome, JobEngine};
pub use scheduler::Scheduler;
pub use store::JobStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::VecDeque;
use strum::{AsRefStr, Display};

/// What a job does when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// Run a registered plugin (`params.plugin` names it, `params.args` is
    /// the argument object).
    Plugin,
    /// Send `params.prompt` to the completion provider.
    Llm,
    /// Archive the datastore and index metadata.
    Backup,
    /// Rebuild the retrieval index.
    Rag,
}

/// Lifecycle status of a job; reflects the most recent run once started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Success,
    Failed,
    Retrying,
    Cancelled,
}

/// When a job fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScheduleSpec {
    /// Fire once, right away.
    Immediate,
    /// Fire every `secs` seconds.
    Interval { secs: u64 },
    /// Fire once at the given instant. Past instants fire immediately.
    Date { at: DateTime<Utc> },
    /// Fire daily at `hour:minute` UTC (03:00 when omitted), optionally
    /// restricted to days of the week (cron day-of-week syntax, e.g.
    /// `"Mon-Fri"`).
    Cron {
        #[serde(default = "default_cron_hour")]
        hour: u32,
        #[serde(default)]
        minute: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        day_of_week: Option<String>,
    },
}

fn default_cron_hour() -> u32 {
    3
}

/// One completed (or abandoned) run of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub status: JobStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub attempts: u32,
}

/// Stored job state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobMeta {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    pub job_type: JobType,
    pub schedule: ScheduleSpec,
    #[serde(default)]
    pub params: Map<String, Value>,
    pub status: JobStatus,
    /// Consecutive failures of the current run; resets to zero on success.
    pub attempts: u32,
    /// Lifetime counters across all runs.
    pub success_count: u64,
    pub failure_count: u64,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error_at: Option<DateTime<Utc>>,
    /// Ring buffer of the most recent runs, oldest first.
    pub recent_runs: VecDeque<RunRecord>,
}

impl JobMeta {
    pub fn new(
        id: String,
        name: String,
        job_type: JobType,
        schedule: ScheduleSpec,
        params: Map<String, Value>,
    ) -> Self {
        Self {
            id,
            name,
            description: None,
            tag: None,
            job_type,
            schedule,
            params,
            status: JobStatus::Pending,
            attempts: 0,
            success_count: 0,
            failure_count: 0,
            created_at: Utc::now(),
            last_run_at: None,
            last_error: None,
            last_error_at: None,
            recent_runs: VecDeque::new(),
        }
    }

    /// Append a run record, evicting the oldest past `limit`.
    pub fn push_run(&mut self, record: RunRecord, limit: usize) {
        self.recent_runs.push_back(record);
        while self.recent_runs.len() > limit {
            self.recent_runs.pop_front();
        }
    }
}
