use crate::error::SandboxError;
use crate::plugins::{Plugin, PluginArgs, PluginIo};
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::mpsc;
use std::time::Duration;

/// Thread-fallback strategy: run the plugin's loaded handle on a dedicated
/// worker thread and wait with a deadline.
///
/// A panic in the hook is caught and reported as a crash instead of taking
/// the host down. On timeout the worker thread is abandoned; it keeps running
/// until the hook returns, but its result is discarded. This strategy cannot
/// forcibly stop plugin code, which is why process isolation is preferred for
/// external plugins.
pub fn run_on_thread(
    name: &str,
    handle: Arc<dyn Plugin>,
    args: PluginArgs,
    timeout: Duration,
) -> (PluginIo, Result<Value, SandboxError>) {
    let (tx, rx) = mpsc::channel();
    let worker_name = name.to_string();
    std::thread::Builder::new()
        .name(format!("plugin-{worker_name}"))
        .spawn(move || {
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
                let mut io = PluginIo::default();
                let value = handle.run(&args, &mut io);
                (io, value)
            }));
            tx.send(result).ok();
        })
        .ok();

    match rx.recv_timeout(timeout) {
        Ok(Ok((io, Ok(value)))) => (io, Ok(value)),
        Ok(Ok((io, Err(error)))) => (
            io,
            Err(SandboxError::Runtime {
                name: name.to_string(),
                message: format!("{error:#}"),
            }),
        ),
        Ok(Err(panic)) => (
            PluginIo::default(),
            Err(SandboxError::Crash {
                name: name.to_string(),
                // `as_ref` reaches the payload itself; `&panic` would hand
                // the box to the downcast and never match.
                message: panic_message(panic.as_ref()),
            }),
        ),
        Err(_) => (
            PluginIo::default(),
            Err(SandboxError::Timeout {
                name: name.to_string(),
                timeout_secs: timeout.as_secs(),
            }),
        ),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic in plugin hook".to_string()
    }
}
