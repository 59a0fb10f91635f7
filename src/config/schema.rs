use anyhow::{Context, Result};
use directories::UserDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

// ── Top-level config ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Workspace directory - computed from home, not serialized
    #[serde(skip)]
    pub workspace_dir: PathBuf,
    /// Path to config.toml - computed from home, not serialized
    #[serde(skip)]
    pub config_path: PathBuf,

    #[serde(default)]
    pub plugins: PluginsConfig,

    #[serde(default)]
    pub jobs: JobsConfig,

    #[serde(default)]
    pub backup: BackupConfig,
}

// ── Plugin engine ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginsConfig {
    /// Wall-clock budget for one plugin invocation.
    #[serde(default = "default_plugin_timeout_secs")]
    pub timeout_secs: u64,
    /// Grace period between terminate and force-kill on the process path.
    #[serde(default = "default_hard_kill_grace_secs")]
    pub hard_kill_grace_secs: u64,
    /// Coarse whole-process RSS ceiling; execution is refused above it.
    #[serde(default = "default_max_ram_mb")]
    pub max_ram_mb: u64,
    /// Run external plugins in a separate OS process.
    #[serde(default = "default_sandbox_enabled")]
    pub sandbox_enabled: bool,
    /// Trusted built-ins that skip process isolation.
    #[serde(default = "default_no_sandbox")]
    pub no_sandbox: Vec<String>,
    /// Extra plugin roots scanned in addition to `<workspace>/plugins`.
    #[serde(default)]
    pub extra_dirs: Vec<PathBuf>,
}

fn default_plugin_timeout_secs() -> u64 {
    30
}

fn default_hard_kill_grace_secs() -> u64 {
    2
}

fn default_max_ram_mb() -> u64 {
    512
}

fn default_sandbox_enabled() -> bool {
    true
}

fn default_no_sandbox() -> Vec<String> {
    vec!["tasks".into(), "system_info".into()]
}

impl Default for PluginsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_plugin_timeout_secs(),
            hard_kill_grace_secs: default_hard_kill_grace_secs(),
            max_ram_mb: default_max_ram_mb(),
            sandbox_enabled: default_sandbox_enabled(),
            no_sandbox: default_no_sandbox(),
            extra_dirs: Vec::new(),
        }
    }
}

// ── Jobs / retry policy ───────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    /// Ascending backoff delays; one retry per entry, then terminal FAILED.
    #[serde(default = "default_retry_delays_secs")]
    pub retry_delays_secs: Vec<u64>,
    /// Ring-buffer capacity for per-job run history.
    #[serde(default = "default_recent_runs_limit")]
    pub recent_runs_limit: usize,
}

fn default_retry_delays_secs() -> Vec<u64> {
    vec![5, 15, 45]
}

fn default_recent_runs_limit() -> usize {
    20
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            retry_delays_secs: default_retry_delays_secs(),
            recent_runs_limit: default_recent_runs_limit(),
        }
    }
}

// ── Backup job targets ────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Primary datastore file, relative to the workspace unless absolute.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// Retrieval index metadata, relative to the workspace unless absolute.
    #[serde(default = "default_index_meta_path")]
    pub index_meta_path: PathBuf,
    /// Destination directory for timestamped backup archives.
    #[serde(default = "default_backup_dir")]
    pub backup_dir: PathBuf,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("data/history.db")
}

fn default_index_meta_path() -> PathBuf {
    PathBuf::from("data/index/meta.json")
}

fn default_backup_dir() -> PathBuf {
    PathBuf::from("backups")
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            index_meta_path: default_index_meta_path(),
            backup_dir: default_backup_dir(),
        }
    }
}

// ── Loading / derived paths ───────────────────────────────────────

impl Default for Config {
    fn default() -> Self {
        let home =
            UserDirs::new().map_or_else(|| PathBuf::from("."), |u| u.home_dir().to_path_buf());
        let hestia_dir = home.join(".hestia");

        Self {
            workspace_dir: hestia_dir.join("workspace"),
            config_path: hestia_dir.join("config.toml"),
            plugins: PluginsConfig::default(),
            jobs: JobsConfig::default(),
            backup: BackupConfig::default(),
        }
    }
}

impl Config {
    pub fn load_or_init() -> Result<Self> {
        let home = UserDirs::new()
            .map(|u| u.home_dir().to_path_buf())
            .context("Could not find home directory")?;
        let hestia_dir = home.join(".hestia");
        let config_path = hestia_dir.join("config.toml");

        if !hestia_dir.exists() {
            fs::create_dir_all(&hestia_dir).context("Failed to create .hestia directory")?;
            fs::create_dir_all(hestia_dir.join("workspace"))
                .context("Failed to create workspace directory")?;
        }

        if config_path.exists() {
            let contents =
                fs::read_to_string(&config_path).context("Failed to read config file")?;
            let mut config: Config =
                toml::from_str(&contents).context("Failed to parse config file")?;
            // Set computed paths that are skipped during serialization
            config.config_path.clone_from(&config_path);
            config.workspace_dir = hestia_dir.join("workspace");
            Ok(config)
        } else {
            let config = Self {
                config_path: config_path.clone(),
                workspace_dir: hestia_dir.join("workspace"),
                ..Self::default()
            };
            config.save()?;
            Ok(config)
        }
    }

    pub fn save(&self) -> Result<()> {
        let toml_str = toml::to_string_pretty(self).context("Failed to serialize config")?;
        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.config_path, toml_str).context("Failed to write config file")?;
        Ok(())
    }

    /// Primary plugin root under the workspace.
    pub fn plugin_dir(&self) -> PathBuf {
        self.workspace_dir.join("plugins")
    }

    /// All roots scanned by the registry, primary first.
    pub fn plugin_roots(&self) -> Vec<PathBuf> {
        let mut roots = vec![self.plugin_dir()];
        for dir in &self.plugins.extra_dirs {
            if !roots.contains(dir) {
                roots.push(dir.clone());
            }
        }
        roots
    }

    /// Diagnostic dumps and install checksum records land here.
    pub fn plugin_log_dir(&self) -> PathBuf {
        self.workspace_dir.join("logs").join("plugins")
    }

    /// Append-only audit event log.
    pub fn audit_log_path(&self) -> PathBuf {
        self.workspace_dir.join("logs").join("events.jsonl")
    }

    /// Prompt analytics log written by llm jobs.
    pub fn prompt_log_path(&self) -> PathBuf {
        self.workspace_dir.join("logs").join("prompts.jsonl")
    }

    fn resolve(&self, path: &std::path::Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.workspace_dir.join(path)
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.resolve(&self.backup.db_path)
    }

    pub fn index_meta_path(&self) -> PathBuf {
        self.resolve(&self.backup.index_meta_path)
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.resolve(&self.backup.backup_dir)
    }
}
