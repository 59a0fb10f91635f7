//! Full plugin lifecycle: install from archive, lifecycle transitions,
//! sandboxed execution, reload, delete.

use hestia::audit::AuditLog;
use hestia::config::Config;
use hestia::observability::{ExecOutcome, PluginMetrics};
use hestia::plugins::{PluginRegistry, install_archive};
use hestia::sandbox::SandboxExecutor;
use serde_json::{Map, json};
use std::io::Write;
use std::sync::Arc;
use tempfile::TempDir;
use zip::write::SimpleFileOptions;

struct Fixture {
    config: Config,
    registry: Arc<PluginRegistry>,
    executor: Arc<SandboxExecutor>,
    metrics: Arc<PluginMetrics>,
    audit: Arc<AuditLog>,
}

fn fixture(tmp: &TempDir) -> Fixture {
    let mut config = Config::default();
    config.workspace_dir = tmp.path().join("workspace");

    let audit = Arc::new(AuditLog::new(config.audit_log_path()));
    let registry = Arc::new(PluginRegistry::new(
        Arc::clone(&audit),
        config.plugin_log_dir(),
    ));
    registry.load(&config.plugin_roots()).unwrap();
    let metrics = Arc::new(PluginMetrics::new());
    let executor = Arc::new(SandboxExecutor::new(
        Arc::clone(&registry),
        Arc::clone(&metrics),
        Arc::clone(&audit),
        &config,
    ));
    Fixture {
        config,
        registry,
        executor,
        metrics,
        audit,
    }
}

fn zip_archive(entries: &[(&str, &str)]) -> Vec<u8> {
    let mut buffer = std::io::Cursor::new(Vec::new());
    {
        let mut writer = zip::ZipWriter::new(&mut buffer);
        for (name, body) in entries {
            writer
                .start_file(*name, SimpleFileOptions::default())
                .unwrap();
            writer.write_all(body.as_bytes()).unwrap();
        }
        writer.finish().unwrap();
    }
    buffer.into_inner()
}

const GREETER_MANIFEST: &str = r#"
[plugin]
description = "prints a greeting"
permissions = ["process"]

[entry]
command = "echo '{\"greeting\": \"hello\"}'"

[inputs.schema.who]
kind = "string"
"#;

#[tokio::test]
async fn install_enable_run_reload_delete() {
    let tmp = TempDir::new().unwrap();
    let fx = fixture(&tmp);
    let archive = zip_archive(&[("greeter/plugin.toml", GREETER_MANIFEST)]);

    // install
    let report = install_archive(&archive, &fx.config, &fx.registry, &fx.audit).unwrap();
    assert_eq!(report.name, "greeter");
    assert!(!report.replaced);
    assert!(fx.registry.contains("greeter"));

    // lifecycle up
    fx.registry.enable("greeter").unwrap();
    fx.registry.start("greeter").unwrap();

    // sandboxed run (process isolation: command plugin, not on allowlist)
    let mut args = Map::new();
    args.insert("who".into(), json!("world"));
    let value = fx.executor.run("greeter", args).await.unwrap();
    assert_eq!(value, json!({"greeting": "hello"}));
    assert_eq!(fx.metrics.count("greeter", ExecOutcome::Success), 1);

    // reload keeps it running
    fx.registry.reload("greeter").unwrap();
    let value = fx.executor.run("greeter", Map::new()).await.unwrap();
    assert_eq!(value["greeting"], "hello");

    // delete removes the package from disk
    fx.registry.delete("greeter").unwrap();
    assert!(!fx.registry.contains("greeter"));
    assert!(!fx.config.plugin_dir().join("greeter").exists());

    // the audit log saw the whole story
    let events = std::fs::read_to_string(fx.config.audit_log_path()).unwrap();
    for event in [
        "plugin.installed",
        "plugin.enabled",
        "plugin.started",
        "plugin.run",
        "plugin.reloaded",
        "plugin.deleted",
    ] {
        assert!(events.contains(event), "missing audit event {event}");
    }
}

#[tokio::test]
async fn reinstalling_replaces_and_updates_behavior() {
    let tmp = TempDir::new().unwrap();
    let fx = fixture(&tmp);

    let v1 = zip_archive(&[(
        "counter/plugin.toml",
        "[plugin]\ndescription = \"v1\"\n\n[entry]\ncommand = \"echo '{\\\"version\\\": 1}'\"\n",
    )]);
    let v2 = zip_archive(&[(
        "counter/plugin.toml",
        "[plugin]\ndescription = \"v2\"\n\n[entry]\ncommand = \"echo '{\\\"version\\\": 2}'\"\n",
    )]);

    install_archive(&v1, &fx.config, &fx.registry, &fx.audit).unwrap();
    fx.registry.ensure_running("counter").unwrap();
    let value = fx.executor.run("counter", Map::new()).await.unwrap();
    assert_eq!(value["version"], 1);

    let report = install_archive(&v2, &fx.config, &fx.registry, &fx.audit).unwrap();
    assert!(report.replaced);
    fx.registry.ensure_running("counter").unwrap();
    let value = fx.executor.run("counter", Map::new()).await.unwrap();
    assert_eq!(value["version"], 2);
}

#[tokio::test]
async fn declared_inputs_gate_execution() {
    let tmp = TempDir::new().unwrap();
    let fx = fixture(&tmp);
    let archive = zip_archive(&[(
        "strict/plugin.toml",
        r#"
[plugin]
description = "requires a city"

[entry]
command = "cat"

[inputs.schema.city]
kind = "string"
required = true
"#,
    )]);

    install_archive(&archive, &fx.config, &fx.registry, &fx.audit).unwrap();
    fx.registry.ensure_running("strict").unwrap();

    let err = fx.executor.run("strict", Map::new()).await.unwrap_err();
    assert!(err.to_string().contains("city"));

    let mut args = Map::new();
    args.insert("city".into(), json!("Lyon"));
    let value = fx.executor.run("strict", args).await.unwrap();
    assert_eq!(value, json!({"city": "Lyon"}));
}

#[test]
fn zip_slip_archive_never_touches_the_workspace() {
    let tmp = TempDir::new().unwrap();
    let fx = fixture(&tmp);
    let archive = zip_archive(&[
        ("greeter/plugin.toml", GREETER_MANIFEST),
        ("../outside.txt", "escaped"),
    ]);

    assert!(install_archive(&archive, &fx.config, &fx.registry, &fx.audit).is_err());
    assert!(!fx.registry.contains("greeter"));
    assert!(!tmp.path().join("outside.txt").exists());
}
