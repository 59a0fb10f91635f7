//! Sandboxed plugin execution.
//!
//! Two strategies: process isolation (preferred, enforceable kill path) and a
//! thread fallback for trusted built-ins or when isolation is disabled. The
//! executor picks the strategy, applies the resource ceiling, validates
//! declared inputs, records metrics and audit events, and dumps diagnostics
//! on failure.

pub mod process;
pub mod thread;

use crate::audit::AuditLog;
use crate::audit_fields;
use crate::config::Config;
use crate::error::{PluginError, Result, SandboxError};
use crate::observability::{ExecOutcome, PluginMetrics};
use crate::plugins::{PluginArgs, PluginEntry, PluginIo, PluginRegistry, PluginState, diagnostics};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Coarse whole-process resident set size, in megabytes.
///
/// Read from `/proc/self/statm`; this is a host-level ceiling, not a per
/// plugin accounting.
#[cfg(target_os = "linux")]
pub fn current_rss_mb() -> u64 {
    std::fs::read_to_string("/proc/self/statm")
        .ok()
        .and_then(|statm| statm.split_whitespace().nth(1)?.parse::<u64>().ok())
        .map(|pages| pages * page_size() / (1024 * 1024))
        .unwrap_or(0)
}

#[cfg(not(target_os = "linux"))]
pub fn current_rss_mb() -> u64 {
    0
}

#[cfg(target_os = "linux")]
fn page_size() -> u64 {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 { size as u64 } else { 4096 }
}

/// Which strategy an invocation will use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecStrategy {
    Process,
    Thread,
}

/// Runs plugins under the configured isolation policy.
pub struct SandboxExecutor {
    registry: Arc<PluginRegistry>,
    metrics: Arc<PluginMetrics>,
    audit: Arc<AuditLog>,
    timeout: Duration,
    grace: Duration,
    max_ram_mb: u64,
    sandbox_enabled: bool,
    no_sandbox: Vec<String>,
    log_dir: PathBuf,
}

impl SandboxExecutor {
    pub fn new(
        registry: Arc<PluginRegistry>,
        metrics: Arc<PluginMetrics>,
        audit: Arc<AuditLog>,
        config: &Config,
    ) -> Self {
        Self {
            registry,
            metrics,
            audit,
            timeout: Duration::from_secs(config.plugins.timeout_secs),
            grace: Duration::from_secs(config.plugins.hard_kill_grace_secs),
            max_ram_mb: config.plugins.max_ram_mb,
            sandbox_enabled: config.plugins.sandbox_enabled,
            no_sandbox: config.plugins.no_sandbox.clone(),
            log_dir: config.plugin_log_dir(),
        }
    }

    /// Strategy selection: process isolation only applies to plugins with a
    /// subprocess form, and trusted names on the allowlist stay in-process.
    pub fn strategy_for(&self, name: &str, has_exec_entry: bool) -> ExecStrategy {
        if self.sandbox_enabled && has_exec_entry && !self.no_sandbox.iter().any(|n| n == name) {
            ExecStrategy::Process
        } else {
            ExecStrategy::Thread
        }
    }

    /// Execute one plugin invocation.
    ///
    /// The plugin must be `Running`. Declared inputs are validated before any
    /// code runs, and execution is refused outright while the process is over
    /// the memory ceiling.
    pub async fn run(&self, name: &str, args: PluginArgs) -> Result<Value> {
        let descriptor = self.registry.descriptor(name)?;
        if descriptor.state != PluginState::Running {
            return Err(PluginError::InvalidTransition {
                name: name.to_string(),
                operation: "run",
                state: descriptor.state.to_string(),
            }
            .into());
        }

        let rss_mb = current_rss_mb();
        if rss_mb > self.max_ram_mb {
            return Err(SandboxError::ResourceExceeded {
                rss_mb,
                limit_mb: self.max_ram_mb,
            }
            .into());
        }

        if let Some(schema) = &descriptor.meta.inputs
            && let Err(reason) = schema.validate(&args)
        {
            return Err(PluginError::Validation {
                name: name.to_string(),
                reason,
            }
            .into());
        }

        let strategy = self.strategy_for(name, descriptor.has_exec_entry());
        let started = Instant::now();
        let (io, result) = match (strategy, &descriptor.entry, &descriptor.path) {
            (ExecStrategy::Process, PluginEntry::Command { command }, Some(dir)) => {
                process::run_isolated(name, command, dir, &args, self.timeout, self.grace).await
            }
            _ => {
                let worker_name = name.to_string();
                let handle = Arc::clone(&descriptor.handle);
                let worker_args = args.clone();
                let timeout = self.timeout;
                tokio::task::spawn_blocking(move || {
                    thread::run_on_thread(&worker_name, handle, worker_args, timeout)
                })
                .await
                .unwrap_or_else(|join_error| {
                    (
                        PluginIo::default(),
                        Err(SandboxError::Crash {
                            name: name.to_string(),
                            message: format!("execution task failed: {join_error}"),
                        }),
                    )
                })
            }
        };

        let outcome = match &result {
            Ok(_) => ExecOutcome::Success,
            Err(SandboxError::Timeout { .. }) => ExecOutcome::Timeout,
            Err(SandboxError::Crash { .. }) => ExecOutcome::Crash,
            Err(_) => ExecOutcome::Error,
        };
        self.metrics.inc(name, outcome);

        let error_text = result.as_ref().err().map(ToString::to_string);
        if let Some(message) = &error_text {
            diagnostics::dump_failure(&self.log_dir, name, &io, message);
            tracing::warn!(plugin = name, outcome = outcome.as_ref(), %message, "plugin run failed");
        } else {
            tracing::debug!(plugin = name, elapsed_ms = started.elapsed().as_millis() as u64, "plugin run ok");
        }

        self.audit.record(
            "plugin.run",
            audit_fields! {
                "plugin" => name,
                "outcome" => outcome.as_ref(),
                "duration_ms" => started.elapsed().as_millis() as u64,
                "sandboxed" => strategy == ExecStrategy::Process,
                "params" => Value::Object(args),
                "error" => error_text,
            },
        );

        result.map_err(Into::into)
    }
}
