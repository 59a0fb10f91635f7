use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::io::Write;
use std::path::PathBuf;
use zip::write::SimpleFileOptions;

/// Text completion backend used by `llm` jobs.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String>;
}

/// Offline provider used when no model backend is configured. Jobs still
/// exercise the full pipeline; the response just acknowledges the prompt.
pub struct OfflineCompletion;

#[async_trait]
impl CompletionProvider for OfflineCompletion {
    async fn complete(&self, prompt: &str) -> Result<String> {
        Ok(format!(
            "[offline] no model backend configured ({} chars queued)",
            prompt.len()
        ))
    }
}

/// Retrieval index rebuilder used by `rag` jobs. Returns the number of
/// documents indexed.
#[async_trait]
pub trait Reindexer: Send + Sync {
    async fn reindex(&self) -> Result<u64>;
}

/// Placeholder until a retrieval backend is wired in.
pub struct NoopReindexer;

#[async_trait]
impl Reindexer for NoopReindexer {
    async fn reindex(&self) -> Result<u64> {
        Ok(0)
    }
}

/// Archives the datastore and index metadata into a timestamped zip.
///
/// Absent source files are skipped rather than failing the backup; the
/// archive is written even when every source is missing.
pub struct BackupExporter {
    db_path: PathBuf,
    index_meta_path: PathBuf,
    backup_dir: PathBuf,
}

impl BackupExporter {
    pub fn new(config: &crate::config::Config) -> Self {
        Self {
            db_path: config.db_path(),
            index_meta_path: config.index_meta_path(),
            backup_dir: config.backup_dir(),
        }
    }

    pub fn run(&self) -> Result<PathBuf> {
        let sources: Vec<&PathBuf> = [&self.db_path, &self.index_meta_path]
            .into_iter()
            .filter(|p| p.is_file())
            .collect();

        std::fs::create_dir_all(&self.backup_dir).context("failed to create backup dir")?;
        let stamp = Utc::now().format("%Y%m%d-%H%M%S");
        let archive_path = self.backup_dir.join(format!("hestia-backup-{stamp}.zip"));

        let file = std::fs::File::create(&archive_path)
            .with_context(|| format!("failed to create {}", archive_path.display()))?;
        let mut writer = zip::ZipWriter::new(file);
        let options = SimpleFileOptions::default();

        for source in sources {
            let entry_name = source
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("unnamed");
            let contents = std::fs::read(source)
                .with_context(|| format!("failed to read {}", source.display()))?;
            writer.start_file(entry_name, options)?;
            writer.write_all(&contents)?;
        }
        writer.finish()?;

        Ok(archive_path)
    }
}

/// Append-only JSONL log of prompts sent by `llm` jobs.
pub struct PromptLog {
    path: PathBuf,
}

impl PromptLog {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Best-effort append; an unwritable log never fails the job.
    pub fn append(&self, job_id: &str, prompt: &str, response: &str) {
        let record = serde_json::json!({
            "recorded_at": Utc::now().to_rfc3339(),
            "job_id": job_id,
            "prompt": prompt,
            "response_chars": response.chars().count(),
        });
        let write = || -> std::io::Result<()> {
            if let Some(parent) = self.path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)?;
            writeln!(file, "{record}")
        };
        if let Err(error) = write() {
            tracing::warn!(path = %self.path.display(), %error, "prompt log append failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use tempfile::TempDir;

    fn config(tmp: &TempDir) -> Config {
        let mut config = Config::default();
        config.workspace_dir = tmp.path().to_path_buf();
        config
    }

    #[tokio::test]
    async fn offline_completion_acknowledges_prompt() {
        let response = OfflineCompletion.complete("hello there").await.unwrap();
        assert!(response.contains("11 chars"));
    }

    #[test]
    fn backup_skips_absent_sources() {
        let tmp = TempDir::new().unwrap();
        let config = config(&tmp);
        std::fs::create_dir_all(config.db_path().parent().unwrap()).unwrap();
        std::fs::write(config.db_path(), b"data").unwrap();
        // index metadata intentionally absent

        let exporter = BackupExporter::new(&config);
        let archive = exporter.run().unwrap();
        assert!(archive.exists());

        let file = std::fs::File::open(&archive).unwrap();
        let zip = zip::ZipArchive::new(file).unwrap();
        assert_eq!(zip.len(), 1);
    }

    #[test]
    fn backup_with_no_sources_writes_an_empty_archive() {
        let tmp = TempDir::new().unwrap();
        let exporter = BackupExporter::new(&config(&tmp));
        let archive = exporter.run().unwrap();
        assert!(archive.exists());

        let file = std::fs::File::open(&archive).unwrap();
        let zip = zip::ZipArchive::new(file).unwrap();
        assert_eq!(zip.len(), 0);
    }

    #[test]
    fn prompt_log_appends_jsonl() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("logs/prompts.jsonl");
        let log = PromptLog::new(path.clone());
        log.append("abc", "what's the weather", "sunny");
        log.append("abc", "and tomorrow", "rain");

        let lines: Vec<String> = std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(String::from)
            .collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(&lines[0]).unwrap();
        assert_eq!(first["job_id"], "abc");
        assert_eq!(first["response_chars"], 5);
    }
}
