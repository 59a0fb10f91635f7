use super::manifest::{FieldKind, FieldSpec, InputSchema};
use super::{Plugin, PluginArgs, PluginIo, PluginMeta};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;

/// Explicit registry of trusted built-in plugins.
///
/// Built-ins run in-process on the thread-fallback path and are seeded into
/// the registry on every load, so a fresh workspace has something to run.
pub fn resolve(name: &str) -> Option<Arc<dyn Plugin>> {
    match name {
        "system_info" => Some(Arc::new(SystemInfoPlugin::new())),
        "tasks" => Some(Arc::new(TasksPlugin::new())),
        _ => None,
    }
}

/// Names seeded into the registry ahead of the on-disk scan.
pub fn names() -> &'static [&'static str] {
    &["system_info", "tasks"]
}

// ── system_info ──────────────────────────────────────────────────

/// Reports host facts about the assistant process.
struct SystemInfoPlugin {
    meta: PluginMeta,
}

impl SystemInfoPlugin {
    fn new() -> Self {
        Self {
            meta: PluginMeta {
                name: "system_info".into(),
                description: "Report host OS, architecture and process memory".into(),
                permissions: vec!["process".into()],
                inputs: None,
            },
        }
    }
}

impl Plugin for SystemInfoPlugin {
    fn meta(&self) -> &PluginMeta {
        &self.meta
    }

    fn run(&self, _args: &PluginArgs, io: &mut PluginIo) -> anyhow::Result<Value> {
        let rss_mb = crate::sandbox::current_rss_mb();
        io.out("collected host facts");
        Ok(json!({
            "os": std::env::consts::OS,
            "arch": std::env::consts::ARCH,
            "pid": std::process::id(),
            "rss_mb": rss_mb,
        }))
    }
}

// ── tasks ────────────────────────────────────────────────────────

/// Tiny in-memory task list used by the assistant's reminders.
struct TasksPlugin {
    meta: PluginMeta,
    items: Mutex<Vec<String>>,
    started: Mutex<bool>,
}

impl TasksPlugin {
    fn new() -> Self {
        let mut fields = BTreeMap::new();
        fields.insert(
            "action".to_string(),
            FieldSpec {
                kind: FieldKind::String,
                required: true,
            },
        );
        fields.insert(
            "title".to_string(),
            FieldSpec {
                kind: FieldKind::String,
                required: false,
            },
        );

        Self {
            meta: PluginMeta {
                name: "tasks".into(),
                description: "Add, list and clear short-lived task notes".into(),
                permissions: vec![],
                inputs: Some(InputSchema::new(fields)),
            },
            items: Mutex::new(Vec::new()),
            started: Mutex::new(false),
        }
    }

    fn lock_items(&self) -> std::sync::MutexGuard<'_, Vec<String>> {
        self.items
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Plugin for TasksPlugin {
    fn meta(&self) -> &PluginMeta {
        &self.meta
    }

    fn start(&self, io: &mut PluginIo) -> anyhow::Result<()> {
        *self
            .started
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = true;
        io.out("tasks ready");
        Ok(())
    }

    fn stop(&self, _io: &mut PluginIo) -> anyhow::Result<()> {
        *self
            .started
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = false;
        Ok(())
    }

    fn run(&self, args: &PluginArgs, _io: &mut PluginIo) -> anyhow::Result<Value> {
        let action = args
            .get("action")
            .and_then(Value::as_str)
            .unwrap_or("list");

        match action {
            "add" => {
                let title = args
                    .get("title")
                    .and_then(Value::as_str)
                    .ok_or_else(|| anyhow::anyhow!("add requires a title"))?;
                let mut items = self.lock_items();
                items.push(title.to_string());
                Ok(json!({ "added": title, "count": items.len() }))
            }
            "list" => {
                let items = self.lock_items();
                Ok(json!({ "tasks": *items }))
            }
            "clear" => {
                let mut items = self.lock_items();
                let removed = items.len();
                items.clear();
                Ok(json!({ "removed": removed }))
            }
            other => anyhow::bail!("unknown action: {other}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    #[test]
    fn resolve_knows_every_seeded_name() {
        for name in names() {
            assert!(resolve(name).is_some(), "missing builtin {name}");
        }
        assert!(resolve("nope").is_none());
    }

    #[test]
    fn system_info_reports_current_process() {
        let plugin = resolve("system_info").unwrap();
        let mut io = PluginIo::default();
        let value = plugin.run(&Map::new(), &mut io).unwrap();
        assert_eq!(value["os"], std::env::consts::OS);
        assert_eq!(value["pid"], std::process::id());
    }

    #[test]
    fn tasks_add_list_clear_round_trip() {
        let plugin = resolve("tasks").unwrap();
        let mut io = PluginIo::default();

        let mut add = Map::new();
        add.insert("action".into(), json!("add"));
        add.insert("title".into(), json!("water the plants"));
        let added = plugin.run(&add, &mut io).unwrap();
        assert_eq!(added["count"], 1);

        let mut list = Map::new();
        list.insert("action".into(), json!("list"));
        let listed = plugin.run(&list, &mut io).unwrap();
        assert_eq!(listed["tasks"][0], "water the plants");

        let mut clear = Map::new();
        clear.insert("action".into(), json!("clear"));
        let cleared = plugin.run(&clear, &mut io).unwrap();
        assert_eq!(cleared["removed"], 1);
    }

    #[test]
    fn tasks_add_without_title_fails() {
        let plugin = resolve("tasks").unwrap();
        let mut io = PluginIo::default();
        let mut add = Map::new();
        add.insert("action".into(), json!("add"));
        assert!(plugin.run(&add, &mut io).is_err());
    }
}
