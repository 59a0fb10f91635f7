use super::{Plugin, PluginArgs, PluginIo, PluginMeta};
use anyhow::{Context, Result, bail};
use serde_json::Value;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};

/// Loaded handle for an external plugin: a shell command speaking the
/// subprocess protocol (args JSON on stdin, result as the last JSON line on
/// stdout, non-zero exit is a runtime error).
///
/// This is what the thread-fallback strategy invokes when process isolation
/// is disabled; the process-isolation strategy spawns the same command itself
/// so it can enforce the kill path.
pub struct CommandPlugin {
    meta: PluginMeta,
    command: String,
    dir: PathBuf,
}

impl CommandPlugin {
    pub fn new(meta: PluginMeta, command: String, dir: PathBuf) -> Self {
        Self { meta, command, dir }
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn dir(&self) -> &std::path::Path {
        &self.dir
    }
}

impl Plugin for CommandPlugin {
    fn meta(&self) -> &PluginMeta {
        &self.meta
    }

    fn run(&self, args: &PluginArgs, io: &mut PluginIo) -> Result<Value> {
        let mut child = Command::new("sh")
            .arg("-lc")
            .arg(&self.command)
            .current_dir(&self.dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to spawn plugin command: {}", self.command))?;

        if let Some(stdin) = child.stdin.as_mut() {
            let payload = Value::Object(args.clone()).to_string();
            stdin.write_all(payload.as_bytes()).ok();
        }

        let output = child
            .wait_with_output()
            .context("failed to collect plugin output")?;

        io.stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        io.stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if !output.status.success() {
            let detail = io.stderr.trim();
            if detail.is_empty() {
                bail!("plugin exited with {}", output.status);
            }
            bail!("{detail}");
        }

        parse_result(&io.stdout)
    }
}

/// Extract the result from captured stdout: the last non-empty line parsed
/// as JSON, falling back to the raw text for plugins that just print.
pub fn parse_result(stdout: &str) -> Result<Value> {
    let last_line = stdout.lines().rev().find(|line| !line.trim().is_empty());
    match last_line {
        Some(line) => Ok(serde_json::from_str(line.trim())
            .unwrap_or_else(|_| Value::String(stdout.trim().to_string()))),
        None => bail!("plugin produced no output"),
    }
}
