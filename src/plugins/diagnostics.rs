use super::PluginIo;
use chrono::Local;
use std::path::{Path, PathBuf};

/// Write a per-plugin, per-timestamp failure dump and return its path.
///
/// Captures whatever the plugin printed around the failure plus the error
/// itself, mirroring the event log without polluting it with multi-line text.
pub fn dump_failure(log_dir: &Path, name: &str, io: &PluginIo, error: &str) -> Option<PathBuf> {
    let ts = Local::now().format("%Y%m%d-%H%M%S");
    let path = log_dir.join(format!("{name}-{ts}.log"));

    let body = format!(
        "=== stdout ===\n{}\n\n=== stderr ===\n{}\n\n=== error ===\n{}\n",
        io.stdout, io.stderr, error
    );

    if let Err(write_error) = std::fs::create_dir_all(log_dir)
        .and_then(|()| std::fs::write(&path, body))
    {
        tracing::warn!(plugin = name, %write_error, "failed to write diagnostic dump");
        return None;
    }

    tracing::debug!(plugin = name, path = %path.display(), "diagnostic dump written");
    Some(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn dump_contains_streams_and_error() {
        let tmp = TempDir::new().unwrap();
        let mut io = PluginIo::default();
        io.out("loading config");
        io.err("missing key");

        let path = dump_failure(tmp.path(), "weather", &io, "boom").unwrap();
        let body = std::fs::read_to_string(&path).unwrap();
        assert!(body.contains("loading config"));
        assert!(body.contains("missing key"));
        assert!(body.contains("boom"));
        assert!(
            path.file_name()
                .unwrap()
                .to_string_lossy()
                .starts_with("weather-")
        );
    }

    #[test]
    fn unwritable_dir_returns_none() {
        let io = PluginIo::default();
        assert!(dump_failure(Path::new("/dev/null/nope"), "p", &io, "x").is_none());
    }
}
