use super::command::CommandPlugin;
use super::manifest::PluginManifest;
use super::{PluginDescriptor, PluginEntry, PluginIo, PluginState, builtin, diagnostics};
use crate::audit::AuditLog;
use crate::audit_fields;
use crate::error::{PluginError, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

/// Owned plugin table with a lifecycle state machine per entry.
///
/// Every transition is transactional: on hook failure the pre-operation state
/// is restored and the error propagates to the caller. Transitions are
/// serialized by the table lock; execution (`run`) happens outside it, on a
/// cloned descriptor.
pub struct PluginRegistry {
    plugins: Mutex<HashMap<String, PluginDescriptor>>,
    audit: Arc<AuditLog>,
    log_dir: PathBuf,
}

/// Listing row for API/CLI callers.
#[derive(Debug, Clone, Serialize)]
pub struct PluginSummary {
    pub name: String,
    pub state: String,
    pub description: String,
    pub permissions: Vec<String>,
    pub path: Option<PathBuf>,
}

impl PluginRegistry {
    pub fn new(audit: Arc<AuditLog>, log_dir: PathBuf) -> Self {
        Self {
            plugins: Mutex::new(HashMap::new()),
            audit,
            log_dir,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, PluginDescriptor>> {
        self.plugins
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn audit_event(&self, action: &str, name: &str, mut fields: serde_json::Map<String, serde_json::Value>) {
        fields.insert("plugin".into(), serde_json::Value::String(name.to_string()));
        self.audit.record(&format!("plugin.{action}"), fields);
    }

    // ── Discovery ────────────────────────────────────────────────

    /// Discover and (re)load plugins from the given roots.
    ///
    /// Built-ins are seeded first, then each root is scanned for package
    /// directories holding a `plugin.toml` (entries starting with `_` are
    /// skipped, e.g. `_template`). Lifecycle state survives a reload: a
    /// plugin that was running before `load` is reported in its prior state.
    pub fn load(&self, roots: &[PathBuf]) -> Result<Vec<String>> {
        let mut table = self.lock();
        let previous_states: HashMap<String, PluginState> = table
            .iter()
            .map(|(name, desc)| (name.clone(), desc.state))
            .collect();
        table.clear();

        for builtin_name in builtin::names() {
            let handle = builtin::resolve(builtin_name)
                .unwrap_or_else(|| unreachable!("seeded builtin {builtin_name} must resolve"));
            let state = previous_states
                .get(*builtin_name)
                .copied()
                .unwrap_or(PluginState::Disabled);
            table.insert(
                (*builtin_name).to_string(),
                PluginDescriptor {
                    meta: handle.meta().clone(),
                    state,
                    entry: PluginEntry::Builtin {
                        name: (*builtin_name).to_string(),
                    },
                    path: None,
                    handle,
                },
            );
        }

        for root in roots {
            let Ok(entries) = std::fs::read_dir(root) else {
                continue;
            };
            for entry in entries.flatten() {
                let dir = entry.path();
                let Some(dir_name) = dir.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                if !dir.is_dir() || dir_name.starts_with('_') {
                    continue;
                }
                if !dir.join("plugin.toml").exists() {
                    continue;
                }

                let descriptor = self.load_package(&dir, dir_name, &previous_states)?;
                table.insert(descriptor.meta.name.clone(), descriptor);
            }
        }

        let mut names: Vec<String> = table.keys().cloned().collect();
        names.sort_unstable();
        drop(table);

        self.audit_event("loaded", "*", audit_fields! { "count" => names.len() });
        Ok(names)
    }

    fn load_package(
        &self,
        dir: &Path,
        dir_name: &str,
        previous_states: &HashMap<String, PluginState>,
    ) -> Result<PluginDescriptor> {
        let manifest_path = dir.join("plugin.toml");
        let manifest = match PluginManifest::load(&manifest_path) {
            Ok(manifest) => manifest,
            Err(error) => {
                let reason = format!("{error:#}");
                let dump =
                    diagnostics::dump_failure(&self.log_dir, dir_name, &PluginIo::default(), &reason);
                return Err(PluginError::Load {
                    name: dir_name.to_string(),
                    reason,
                    dump,
                }
                .into());
            }
        };

        let name = manifest.plugin_name(dir_name);
        manifest.validate_permissions(&name)?;
        manifest.validate_entry(&name)?;

        let meta = super::PluginMeta {
            name: name.clone(),
            description: manifest.plugin.description.clone(),
            permissions: manifest.plugin.permissions.clone(),
            inputs: manifest.compile_schema(),
        };

        let (entry, handle) = if let Some(builtin_name) = &manifest.entry.builtin {
            let Some(handle) = builtin::resolve(builtin_name) else {
                let reason = format!("unknown builtin: {builtin_name}");
                let dump =
                    diagnostics::dump_failure(&self.log_dir, &name, &PluginIo::default(), &reason);
                return Err(PluginError::Load { name, reason, dump }.into());
            };
            (
                PluginEntry::Builtin {
                    name: builtin_name.clone(),
                },
                handle,
            )
        } else {
            let command = manifest
                .entry
                .command
                .clone()
                .unwrap_or_default();
            let handle: Arc<dyn super::Plugin> = Arc::new(CommandPlugin::new(
                meta.clone(),
                command.clone(),
                dir.to_path_buf(),
            ));
            (PluginEntry::Command { command }, handle)
        };

        Ok(PluginDescriptor {
            state: previous_states
                .get(&name)
                .copied()
                .unwrap_or(PluginState::Disabled),
            meta,
            entry,
            path: Some(dir.to_path_buf()),
            handle,
        })
    }

    // ── Queries ──────────────────────────────────────────────────

    pub fn descriptor(&self, name: &str) -> Result<PluginDescriptor> {
        self.lock()
            .get(name)
            .cloned()
            .ok_or_else(|| PluginError::NotFound { name: name.into() }.into())
    }

    pub fn state_of(&self, name: &str) -> Result<PluginState> {
        Ok(self.descriptor(name)?.state)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lock().contains_key(name)
    }

    pub fn list(&self) -> Vec<PluginSummary> {
        let table = self.lock();
        let mut rows: Vec<PluginSummary> = table
            .values()
            .map(|desc| PluginSummary {
                name: desc.meta.name.clone(),
                state: desc.state.to_string(),
                description: desc.meta.description.clone(),
                permissions: desc.meta.permissions.clone(),
                path: desc.path.clone(),
            })
            .collect();
        rows.sort_by(|a, b| a.name.cmp(&b.name));
        rows
    }

    // ── Lifecycle transitions ────────────────────────────────────

    /// disabled/stopped → enabled. Pure metadata flip; idempotent.
    pub fn enable(&self, name: &str) -> Result<()> {
        let mut table = self.lock();
        let desc = table
            .get_mut(name)
            .ok_or_else(|| PluginError::NotFound { name: name.into() })?;
        let previous = desc.state;
        if previous == PluginState::Running {
            return Err(PluginError::InvalidTransition {
                name: name.into(),
                operation: "enable",
                state: previous.to_string(),
            }
            .into());
        }
        desc.state = PluginState::Enabled;
        drop(table);

        self.audit_event(
            "enabled",
            name,
            audit_fields! { "previous_state" => previous.to_string() },
        );
        Ok(())
    }

    /// enabled → running. On hook failure the state is untouched and the
    /// error propagates with a diagnostic dump.
    pub fn start(&self, name: &str) -> Result<()> {
        let mut table = self.lock();
        let desc = table
            .get_mut(name)
            .ok_or_else(|| PluginError::NotFound { name: name.into() })?;
        if desc.state != PluginState::Enabled {
            return Err(PluginError::InvalidTransition {
                name: name.into(),
                operation: "start",
                state: desc.state.to_string(),
            }
            .into());
        }

        let mut io = PluginIo::default();
        if let Err(error) = desc.handle.start(&mut io) {
            let message = format!("{error:#}");
            drop(table);
            diagnostics::dump_failure(&self.log_dir, name, &io, &message);
            return Err(PluginError::Hook {
                name: name.into(),
                hook: "start",
                message,
            }
            .into());
        }
        desc.state = PluginState::Running;
        drop(table);

        self.audit_event("started", name, audit_fields! {});
        Ok(())
    }

    /// running → stopped. On hook failure the plugin stays running.
    pub fn stop(&self, name: &str) -> Result<()> {
        let mut table = self.lock();
        let desc = table
            .get_mut(name)
            .ok_or_else(|| PluginError::NotFound { name: name.into() })?;
        if desc.state != PluginState::Running {
            return Err(PluginError::InvalidTransition {
                name: name.into(),
                operation: "stop",
                state: desc.state.to_string(),
            }
            .into());
        }

        let mut io = PluginIo::default();
        if let Err(error) = desc.handle.stop(&mut io) {
            let message = format!("{error:#}");
            drop(table);
            diagnostics::dump_failure(&self.log_dir, name, &io, &message);
            return Err(PluginError::Hook {
                name: name.into(),
                hook: "stop",
                message,
            }
            .into());
        }
        desc.state = PluginState::Stopped;
        drop(table);

        self.audit_event("stopped", name, audit_fields! {});
        Ok(())
    }

    /// any → disabled. A running plugin is stopped first; if that fails the
    /// previous state is preserved and the error propagates.
    pub fn disable(&self, name: &str) -> Result<()> {
        let mut table = self.lock();
        let desc = table
            .get_mut(name)
            .ok_or_else(|| PluginError::NotFound { name: name.into() })?;
        let previous = desc.state;

        if previous == PluginState::Running {
            let mut io = PluginIo::default();
            if let Err(error) = desc.handle.stop(&mut io) {
                let message = format!("{error:#}");
                drop(table);
                diagnostics::dump_failure(&self.log_dir, name, &io, &message);
                return Err(PluginError::Hook {
                    name: name.into(),
                    hook: "stop",
                    message,
                }
                .into());
            }
        }
        desc.state = PluginState::Disabled;
        drop(table);

        self.audit_event(
            "disabled",
            name,
            audit_fields! { "previous_state" => previous.to_string() },
        );
        Ok(())
    }

    /// Reimport the package from disk with full rollback on failure.
    ///
    /// Snapshot first; stop if running; rebuild the descriptor; re-enable and
    /// re-start if it was running. Any failure restores the snapshot,
    /// including an attempt to restart the old handle.
    pub fn reload(&self, name: &str) -> Result<()> {
        let snapshot = self.descriptor(name)?;
        let was_running = snapshot.state == PluginState::Running;

        if was_running {
            self.stop(name)?;
        }

        let rebuilt = match self.rebuild(&snapshot) {
            Ok(descriptor) => descriptor,
            Err(error) => {
                self.restore_snapshot(snapshot, was_running);
                return Err(error);
            }
        };

        {
            let mut table = self.lock();
            table.insert(name.to_string(), rebuilt);
            let desc = table
                .get_mut(name)
                .unwrap_or_else(|| unreachable!("descriptor inserted above"));
            desc.state = PluginState::Enabled;
        }

        if was_running
            && let Err(error) = self.start(name)
        {
            self.restore_snapshot(snapshot, was_running);
            return Err(error);
        }

        self.audit_event(
            "reloaded",
            name,
            audit_fields! { "was_running" => was_running },
        );
        Ok(())
    }

    fn rebuild(&self, snapshot: &PluginDescriptor) -> Result<PluginDescriptor> {
        let name = &snapshot.meta.name;
        match (&snapshot.path, &snapshot.entry) {
            (Some(dir), _) => {
                let dir_name = dir
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or(name)
                    .to_string();
                self.load_package(dir, &dir_name, &HashMap::new())
            }
            (None, PluginEntry::Builtin { name: builtin_name }) => {
                let handle = builtin::resolve(builtin_name).ok_or_else(|| PluginError::Load {
                    name: name.clone(),
                    reason: format!("unknown builtin: {builtin_name}"),
                    dump: None,
                })?;
                Ok(PluginDescriptor {
                    meta: handle.meta().clone(),
                    state: PluginState::Disabled,
                    entry: snapshot.entry.clone(),
                    path: None,
                    handle,
                })
            }
            (None, PluginEntry::Command { .. }) => Err(PluginError::Load {
                name: name.clone(),
                reason: "command plugin has no package directory".into(),
                dump: None,
            }
            .into()),
        }
    }

    fn restore_snapshot(&self, snapshot: PluginDescriptor, was_running: bool) {
        let name = snapshot.meta.name.clone();
        let handle = Arc::clone(&snapshot.handle);
        self.lock().insert(name.clone(), snapshot);

        // Best effort: the old handle was stopped on the way in.
        if was_running {
            let mut io = PluginIo::default();
            if let Err(error) = handle.start(&mut io) {
                diagnostics::dump_failure(&self.log_dir, &name, &io, &format!("{error:#}"));
            }
        }
    }

    /// Remove a plugin. A running plugin is stopped first; on-disk deletion,
    /// once performed, is not reversible.
    pub fn delete(&self, name: &str) -> Result<()> {
        let descriptor = self.descriptor(name)?;
        if descriptor.state == PluginState::Running {
            self.stop(name)?;
        }

        self.lock().remove(name);
        if let Some(dir) = &descriptor.path
            && let Err(error) = std::fs::remove_dir_all(dir)
        {
            tracing::warn!(plugin = name, %error, "failed to remove plugin directory");
        }

        self.audit_event(
            "deleted",
            name,
            audit_fields! {
                "path" => descriptor.path.as_ref().map(|p| p.display().to_string()),
            },
        );
        Ok(())
    }

    /// Bring a plugin to `Running` for a job dispatch, walking whatever
    /// transitions are needed from its current state.
    pub fn ensure_running(&self, name: &str) -> Result<()> {
        match self.state_of(name)? {
            PluginState::Running => Ok(()),
            PluginState::Enabled => self.start(name),
            PluginState::Disabled | PluginState::Stopped => {
                self.enable(name)?;
                self.start(name)
            }
        }
    }
}
