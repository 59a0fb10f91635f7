use std::collections::HashMap;
use std::sync::Mutex;
use strum::AsRefStr;

/// Outcome of one sandboxed plugin invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum ExecOutcome {
    Success,
    Error,
    Timeout,
    Crash,
}

/// Per-plugin, per-outcome execution counters.
///
/// In-memory only; `flush()` logs totals so scrape-less deployments still
/// get a snapshot at shutdown.
#[derive(Debug, Default)]
pub struct PluginMetrics {
    counts: Mutex<HashMap<(String, ExecOutcome), u64>>,
}

impl PluginMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self, plugin: &str, outcome: ExecOutcome) {
        let mut counts = self
            .counts
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *counts.entry((plugin.to_string(), outcome)).or_insert(0) += 1;
    }

    /// Counter value for one plugin/outcome pair.
    pub fn count(&self, plugin: &str, outcome: ExecOutcome) -> u64 {
        let counts = self
            .counts
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        counts
            .get(&(plugin.to_string(), outcome))
            .copied()
            .unwrap_or(0)
    }

    /// Snapshot of all counters, sorted for stable output.
    pub fn snapshot(&self) -> Vec<(String, ExecOutcome, u64)> {
        let counts = self
            .counts
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut rows: Vec<_> = counts
            .iter()
            .map(|((name, outcome), value)| (name.clone(), *outcome, *value))
            .collect();
        rows.sort_by(|a, b| (&a.0, a.1.as_ref()).cmp(&(&b.0, b.1.as_ref())));
        rows
    }

    pub fn flush(&self) {
        for (plugin, outcome, value) in self.snapshot() {
            tracing::debug!(
                plugin = %plugin,
                outcome = outcome.as_ref(),
                total = value,
                "metrics.plugin_exec"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_labels_are_snake_case() {
        assert_eq!(ExecOutcome::Success.as_ref(), "success");
        assert_eq!(ExecOutcome::Timeout.as_ref(), "timeout");
        assert_eq!(ExecOutcome::Crash.as_ref(), "crash");
    }

    #[test]
    fn counters_increment_per_plugin_and_outcome() {
        let metrics = PluginMetrics::new();
        metrics.inc("weather", ExecOutcome::Success);
        metrics.inc("weather", ExecOutcome::Success);
        metrics.inc("weather", ExecOutcome::Timeout);
        metrics.inc("tasks", ExecOutcome::Error);

        assert_eq!(metrics.count("weather", ExecOutcome::Success), 2);
        assert_eq!(metrics.count("weather", ExecOutcome::Timeout), 1);
        assert_eq!(metrics.count("tasks", ExecOutcome::Error), 1);
        assert_eq!(metrics.count("tasks", ExecOutcome::Success), 0);
    }

    #[test]
    fn snapshot_is_sorted_and_complete() {
        let metrics = PluginMetrics::new();
        metrics.inc("b", ExecOutcome::Success);
        metrics.inc("a", ExecOutcome::Crash);

        let rows = metrics.snapshot();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].0, "a");
        assert_eq!(rows[1].0, "b");
    }
}
