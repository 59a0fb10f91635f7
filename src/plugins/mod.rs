//! Plugin packages, registry, lifecycle and installation.
//!
//! A plugin is a directory containing a `plugin.toml` manifest. The manifest
//! names either a trusted built-in implementation (`entry.builtin`) or an
//! external command (`entry.command`) that speaks a small subprocess protocol:
//! invocation arguments arrive as one JSON object on stdin, the result is the
//! last JSON line printed to stdout, and a non-zero exit status is a runtime
//! error. Plugin code is never interpreted in-process.

pub mod builtin;
pub mod command;
pub mod diagnostics;
pub mod install;
pub mod manifest;
pub mod registry;

pub use install::install_archive;
pub use manifest::{FieldKind, FieldSpec, InputSchema, PluginManifest};
pub use registry::PluginRegistry;

use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::Arc;
use strum::{AsRefStr, Display};

/// Arguments passed to a plugin `run` hook.
pub type PluginArgs = Map<String, Value>;

/// Lifecycle state of a registered plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum PluginState {
    Disabled,
    Enabled,
    Running,
    Stopped,
}

/// Validated identity and contract of a plugin.
#[derive(Debug, Clone)]
pub struct PluginMeta {
    pub name: String,
    pub description: String,
    pub permissions: Vec<String>,
    pub inputs: Option<InputSchema>,
}

/// How a plugin invocation is materialized.
#[derive(Debug, Clone)]
pub enum PluginEntry {
    /// Name in the explicit built-in registry.
    Builtin { name: String },
    /// Shell command run in the plugin directory (subprocess protocol).
    Command { command: String },
}

/// Captured output of one hook invocation. Execution strategies return this
/// instead of redirecting process-wide streams.
#[derive(Debug, Default, Clone)]
pub struct PluginIo {
    pub stdout: String,
    pub stderr: String,
}

impl PluginIo {
    pub fn out(&mut self, line: &str) {
        self.stdout.push_str(line);
        self.stdout.push('\n');
    }

    pub fn err(&mut self, line: &str) {
        self.stderr.push_str(line);
        self.stderr.push('\n');
    }
}

/// The fixed plugin interface. The core calls exactly these three hooks.
pub trait Plugin: Send + Sync {
    fn meta(&self) -> &PluginMeta;

    /// Optional initialization hook.
    fn start(&self, _io: &mut PluginIo) -> anyhow::Result<()> {
        Ok(())
    }

    /// Optional cleanup hook.
    fn stop(&self, _io: &mut PluginIo) -> anyhow::Result<()> {
        Ok(())
    }

    /// Required work hook.
    fn run(&self, args: &PluginArgs, io: &mut PluginIo) -> anyhow::Result<Value>;
}

/// Registry entry: one discovered plugin and its lifecycle state.
///
/// Invariant: `state` is `Running` only if the last `start` hook returned Ok.
#[derive(Clone)]
pub struct PluginDescriptor {
    pub meta: PluginMeta,
    pub state: PluginState,
    pub entry: PluginEntry,
    /// On-disk package location; `None` for seeded built-ins.
    pub path: Option<PathBuf>,
    /// Loaded code handle used by the thread-fallback strategy.
    pub handle: Arc<dyn Plugin>,
}

impl std::fmt::Debug for PluginDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginDescriptor")
            .field("name", &self.meta.name)
            .field("state", &self.state)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl PluginDescriptor {
    /// Whether this plugin has a subprocess form the process-isolation
    /// strategy can execute.
    pub fn has_exec_entry(&self) -> bool {
        matches!(self.entry, PluginEntry::Command { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plugin_state_labels_are_snake_case() {
        assert_eq!(PluginState::Disabled.to_string(), "disabled");
        assert_eq!(PluginState::Running.to_string(), "running");
    }

    #[test]
    fn plugin_io_collects_lines() {
        let mut io = PluginIo::default();
        io.out("hello");
        io.err("oops");
        assert_eq!(io.stdout, "hello\n");
        assert_eq!(io.stderr, "oops\n");
    }
}
