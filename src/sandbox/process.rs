use crate::error::SandboxError;
use crate::plugins::command::parse_result;
use crate::plugins::{PluginArgs, PluginIo};
use serde_json::Value;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};

/// Process-isolation strategy: spawn the plugin command in its own OS
/// process so a runaway plugin can be terminated for real.
///
/// Kill path on timeout: SIGTERM, wait out the grace period, then SIGKILL.
pub async fn run_isolated(
    name: &str,
    command: &str,
    dir: &Path,
    args: &PluginArgs,
    timeout: Duration,
    grace: Duration,
) -> (PluginIo, Result<Value, SandboxError>) {
    let mut shell = Command::new("sh");
    shell
        .arg("-lc")
        .arg(command)
        .current_dir(dir)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    // The shell leads its own process group, so the kill path below can
    // reach whatever it spawned.
    #[cfg(unix)]
    shell.process_group(0);
    let spawned = shell.spawn();

    let mut child = match spawned {
        Ok(child) => child,
        Err(error) => {
            return (
                PluginIo::default(),
                Err(SandboxError::Runtime {
                    name: name.to_string(),
                    message: format!("failed to spawn plugin command: {error}"),
                }),
            );
        }
    };

    if let Some(mut stdin) = child.stdin.take() {
        let payload = Value::Object(args.clone()).to_string();
        stdin.write_all(payload.as_bytes()).await.ok();
        // Closing stdin lets `cat`-style plugins see EOF.
        drop(stdin);
    }

    let stdout_task = child.stdout.take().map(|mut reader| {
        tokio::spawn(async move {
            let mut buffer = String::new();
            reader.read_to_string(&mut buffer).await.ok();
            buffer
        })
    });
    let stderr_task = child.stderr.take().map(|mut reader| {
        tokio::spawn(async move {
            let mut buffer = String::new();
            reader.read_to_string(&mut buffer).await.ok();
            buffer
        })
    });

    let wait = tokio::time::timeout(timeout, child.wait()).await;

    let timed_out = wait.is_err();
    if timed_out {
        terminate(&mut child, grace).await;
    }

    let mut io = PluginIo::default();
    io.stdout = drain(stdout_task, timed_out).await;
    io.stderr = drain(stderr_task, timed_out).await;

    if timed_out {
        return (
            io,
            Err(SandboxError::Timeout {
                name: name.to_string(),
                timeout_secs: timeout.as_secs(),
            }),
        );
    }

    let status = match wait {
        Ok(Ok(status)) => status,
        Ok(Err(error)) => {
            return (
                io,
                Err(SandboxError::Runtime {
                    name: name.to_string(),
                    message: format!("failed to await plugin process: {error}"),
                }),
            );
        }
        Err(_) => unreachable!("timeout handled above"),
    };

    if !status.success() {
        // A signal-terminated child has no exit code.
        let error = if status.code().is_none() {
            SandboxError::Crash {
                name: name.to_string(),
                message: format!("plugin process terminated by signal ({status})"),
            }
        } else {
            let detail = io.stderr.trim();
            SandboxError::Runtime {
                name: name.to_string(),
                message: if detail.is_empty() {
                    format!("plugin exited with {status}")
                } else {
                    detail.to_string()
                },
            }
        };
        return (io, Err(error));
    }

    let result = parse_result(&io.stdout).map_err(|error| SandboxError::Runtime {
        name: name.to_string(),
        message: format!("{error:#}"),
    });
    (io, result)
}

/// Collect captured output. After a kill the pipes may still be held by
/// orphaned children that escaped the signal, so the timed-out path stops
/// reading instead of waiting for them.
async fn drain(task: Option<tokio::task::JoinHandle<String>>, bounded: bool) -> String {
    let Some(mut task) = task else {
        return String::new();
    };
    if bounded {
        match tokio::time::timeout(Duration::from_millis(500), &mut task).await {
            Ok(output) => output.unwrap_or_default(),
            Err(_) => {
                task.abort();
                String::new()
            }
        }
    } else {
        task.await.unwrap_or_default()
    }
}

/// SIGTERM first so the plugin can clean up, SIGKILL once the grace period
/// runs out. Signals go to the whole process group: the shell's children
/// hold the output pipes and must not outlive it.
async fn terminate(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        let group = -(pid as libc::pid_t);
        unsafe {
            libc::kill(group, libc::SIGTERM);
        }
        let exited = tokio::time::timeout(grace, child.wait()).await.is_ok();
        unsafe {
            libc::kill(group, libc::SIGKILL);
        }
        if !exited {
            child.wait().await.ok();
        }
        return;
    }

    let _ = grace;
    child.kill().await.ok();
}
