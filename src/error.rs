use std::path::PathBuf;
use thiserror::Error;

// ─── Top-level error hierarchy ───────────────────────────────────────────────

/// Structured error hierarchy for Hestia.
///
/// Each subsystem defines its own error variant. Library callers can match on
/// these to decide recovery strategy; internal code continues to use
/// `anyhow::Result` for ad-hoc context chains.
#[derive(Debug, Error)]
pub enum HestiaError {
    // ── Plugin registry / lifecycle ─────────────────────────────────────
    #[error("plugin: {0}")]
    Plugin(#[from] PluginError),

    // ── Installer ───────────────────────────────────────────────────────
    #[error("install: {0}")]
    Install(#[from] InstallError),

    // ── Sandbox executor ────────────────────────────────────────────────
    #[error("sandbox: {0}")]
    Sandbox(#[from] SandboxError),

    // ── Job store / scheduler / runner ──────────────────────────────────
    #[error("job: {0}")]
    Job(#[from] JobError),

    // ── Trigger parsing ─────────────────────────────────────────────────
    #[error("schedule: {0}")]
    Schedule(#[from] ScheduleError),

    // ── Generic fallthrough (wraps anyhow for interop) ──────────────────
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

// ─── Plugin errors ──────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("plugin {name} not found")]
    NotFound { name: String },

    #[error("plugin {name} validation failed: {reason}")]
    Validation { name: String, reason: String },

    #[error("plugin {name} failed to load: {reason}")]
    Load {
        name: String,
        reason: String,
        /// Diagnostic dump written alongside the failure, when available.
        dump: Option<PathBuf>,
    },

    #[error("plugin {name} cannot {operation} while {state}")]
    InvalidTransition {
        name: String,
        operation: &'static str,
        state: String,
    },

    #[error("plugin {name} {hook} hook failed: {message}")]
    Hook {
        name: String,
        hook: &'static str,
        message: String,
    },
}

// ─── Installer errors ───────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("invalid archive: {0}")]
    InvalidArchive(String),

    #[error("archive entry escapes extraction root: {0}")]
    UnsafePath(String),

    #[error("archive contains no plugin.toml")]
    MissingManifest,

    #[error("invalid plugin name {name:?} (allowed: a-z0-9_+-)")]
    InvalidName { name: String },

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

// ─── Sandbox errors ─────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("plugin {name} timed out after {timeout_secs}s")]
    Timeout { name: String, timeout_secs: u64 },

    #[error("plugin {name} failed: {message}")]
    Runtime { name: String, message: String },

    #[error("plugin {name} crashed: {message}")]
    Crash { name: String, message: String },

    #[error("process memory ceiling reached ({rss_mb}MB > {limit_mb}MB)")]
    ResourceExceeded { rss_mb: u64, limit_mb: u64 },
}

// ─── Job errors ─────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum JobError {
    #[error("job {id} not found")]
    NotFound { id: String },

    #[error("job action failed: {0}")]
    Action(String),
}

// ─── Schedule / trigger errors ──────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("invalid trigger: {0}")]
    Invalid(String),

    #[error("no future occurrence for trigger: {0}")]
    NoFutureOccurrence(String),
}

// ─── Convenience re-exports ─────────────────────────────────────────────────

/// Shorthand result type for the crate.
pub type Result<T> = std::result::Result<T, HestiaError>;
