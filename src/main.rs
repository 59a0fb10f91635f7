#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::struct_field_names
)]

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use hestia::audit::AuditLog;
use hestia::config::Config;
use hestia::jobs::actions::{NoopReindexer, OfflineCompletion};
use hestia::jobs::{JobEngine, JobType, ScheduleSpec};
use hestia::observability::PluginMetrics;
use hestia::plugins::{PluginRegistry, install_archive};
use hestia::sandbox::SandboxExecutor;
use serde_json::Map;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(
    name = "hestia",
    version,
    about = "Job scheduler and sandboxed plugin engine"
)]
struct Cli {
    /// Verbose logging (debug level)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Manage plugins
    Plugins {
        #[command(subcommand)]
        action: PluginCommand,
    },
    /// Manage scheduled jobs
    Jobs {
        #[command(subcommand)]
        action: JobCommand,
    },
    /// Run the scheduler daemon until interrupted
    Serve,
}

#[derive(Subcommand)]
enum PluginCommand {
    /// List registered plugins and their states
    List,
    /// Install a plugin package from a zip archive
    Install { archive: PathBuf },
    /// Enable a plugin
    Enable { name: String },
    /// Start a plugin (must be enabled)
    Start { name: String },
    /// Stop a running plugin
    Stop { name: String },
    /// Disable a plugin, stopping it first if needed
    Disable { name: String },
    /// Reimport a plugin package from disk
    Reload { name: String },
    /// Remove a plugin and its package directory
    Delete { name: String },
    /// Run a plugin once with JSON arguments
    Run {
        name: String,
        /// JSON object of run arguments
        #[arg(long, default_value = "{}")]
        args: String,
    },
}

#[derive(Subcommand)]
enum JobCommand {
    /// Schedule a new job
    Add {
        name: String,
        /// plugin | llm | backup | rag
        #[arg(long = "type")]
        job_type: String,
        /// immediate | interval:SECS | date:RFC3339 | cron:HH:MM[:DOW]
        #[arg(long, default_value = "immediate")]
        schedule: String,
        /// JSON object of job params
        #[arg(long, default_value = "{}")]
        params: String,
        /// Free-form description
        #[arg(long)]
        description: Option<String>,
        /// Grouping tag
        #[arg(long)]
        tag: Option<String>,
    },
    /// List all jobs
    List,
    /// Show one job with its run history
    Show { id: String },
    /// Fire a job outside its schedule
    RunNow { id: String },
    /// Cancel a job's next run
    Cancel { id: String },
    /// Remove a job entirely
    Remove { id: String },
}

/// One place wiring the subsystems together.
struct App {
    config: Config,
    registry: Arc<PluginRegistry>,
    executor: Arc<SandboxExecutor>,
    metrics: Arc<PluginMetrics>,
    audit: Arc<AuditLog>,
    engine: JobEngine,
}

impl App {
    fn bootstrap() -> Result<Self> {
        let config = Config::load_or_init()?;
        let audit = Arc::new(AuditLog::new(config.audit_log_path()));
        let registry = Arc::new(PluginRegistry::new(
            Arc::clone(&audit),
            config.plugin_log_dir(),
        ));
        registry.load(&config.plugin_roots())?;

        let metrics = Arc::new(PluginMetrics::new());
        let executor = Arc::new(SandboxExecutor::new(
            Arc::clone(&registry),
            Arc::clone(&metrics),
            Arc::clone(&audit),
            &config,
        ));
        let engine = JobEngine::new(
            &config,
            Arc::clone(&registry),
            Arc::clone(&executor),
            Arc::clone(&audit),
            Arc::new(OfflineCompletion),
            Arc::new(NoopReindexer),
        );

        Ok(Self {
            config,
            registry,
            executor,
            metrics,
            audit,
            engine,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let app = App::bootstrap()?;
    match cli.command {
        Command::Plugins { action } => run_plugin_command(&app, action).await,
        Command::Jobs { action } => run_job_command(&app, action),
        Command::Serve => serve(&app).await,
    }
}

async fn run_plugin_command(app: &App, action: PluginCommand) -> Result<()> {
    match action {
        PluginCommand::List => {
            for row in app.registry.list() {
                println!("{:<20} {:<10} {}", row.name, row.state, row.description);
            }
        }
        PluginCommand::Install { archive } => {
            let data = std::fs::read(&archive)
                .with_context(|| format!("failed to read {}", archive.display()))?;
            let report = install_archive(&data, &app.config, &app.registry, &app.audit)?;
            let verb = if report.replaced { "replaced" } else { "installed" };
            println!("{} {} (sha256 {})", verb, report.name, report.checksum);
        }
        PluginCommand::Enable { name } => {
            app.registry.enable(&name)?;
            println!("{name} enabled");
        }
        PluginCommand::Start { name } => {
            app.registry.start(&name)?;
            println!("{name} started");
        }
        PluginCommand::Stop { name } => {
            app.registry.stop(&name)?;
            println!("{name} stopped");
        }
        PluginCommand::Disable { name } => {
            app.registry.disable(&name)?;
            println!("{name} disabled");
        }
        PluginCommand::Reload { name } => {
            app.registry.reload(&name)?;
            println!("{name} reloaded");
        }
        PluginCommand::Delete { name } => {
            app.registry.delete(&name)?;
            println!("{name} deleted");
        }
        PluginCommand::Run { name, args } => {
            let args: Map<String, serde_json::Value> =
                serde_json::from_str(&args).context("--args must be a JSON object")?;
            app.registry.ensure_running(&name)?;
            let value = app.executor.run(&name, args).await?;
            println!("{}", serde_json::to_string_pretty(&value)?);
            app.metrics.flush();
        }
    }
    Ok(())
}

fn run_job_command(app: &App, action: JobCommand) -> Result<()> {
    match action {
        JobCommand::Add {
            name,
            job_type,
            schedule,
            params,
            description,
            tag,
        } => {
            let job_type = parse_job_type(&job_type)?;
            let schedule = parse_schedule(&schedule)?;
            let params: Map<String, serde_json::Value> =
                serde_json::from_str(&params).context("--params must be a JSON object")?;

            let job = app
                .engine
                .add_job(&name, job_type, schedule, params, description, tag)?;
            let next = app
                .engine
                .next_run(&job.id)
                .map_or_else(|| "-".to_string(), |t| t.to_rfc3339());
            println!("scheduled {} ({}), next run {}", job.id, job.name, next);
        }
        JobCommand::List => {
            for job in app.engine.list_jobs() {
                let next = app
                    .engine
                    .next_run(&job.id)
                    .map_or_else(|| "-".to_string(), |t| t.to_rfc3339());
                println!(
                    "{:<14} {:<20} {:<8} {:<10} next: {}",
                    job.id, job.name, job.job_type, job.status, next
                );
            }
        }
        JobCommand::Show { id } => {
            let job = app.engine.get_job(&id)?;
            println!("{}", serde_json::to_string_pretty(&job)?);
        }
        JobCommand::RunNow { id } => {
            if app.engine.run_now(&id) {
                println!("{id} fired");
            } else {
                println!("{id} not found");
            }
        }
        JobCommand::Cancel { id } => match app.engine.cancel_job(&id)? {
            hestia::jobs::CancelOutcome::Cancelled => println!("{id} cancelled"),
            hestia::jobs::CancelOutcome::CancelRequested => {
                println!("{id} is running; cancel requested");
            }
        },
        JobCommand::Remove { id } => {
            app.engine.remove_job(&id)?;
            println!("{id} removed");
        }
    }
    Ok(())
}

async fn serve(app: &App) -> Result<()> {
    app.engine.start();
    tracing::info!("hestia scheduler running, press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    app.metrics.flush();
    tracing::info!("shutting down");
    Ok(())
}

fn parse_job_type(text: &str) -> Result<JobType> {
    match text {
        "plugin" => Ok(JobType::Plugin),
        "llm" => Ok(JobType::Llm),
        "backup" => Ok(JobType::Backup),
        "rag" => Ok(JobType::Rag),
        other => bail!("unknown job type: {other} (expected plugin|llm|backup|rag)"),
    }
}

/// Parse the CLI trigger shorthand.
fn parse_schedule(text: &str) -> Result<ScheduleSpec> {
    if text == "immediate" {
        return Ok(ScheduleSpec::Immediate);
    }
    if let Some(secs) = text.strip_prefix("interval:") {
        let secs: u64 = secs.parse().context("interval seconds must be a number")?;
        return Ok(ScheduleSpec::Interval { secs });
    }
    if let Some(stamp) = text.strip_prefix("date:") {
        let at = chrono::DateTime::parse_from_rfc3339(stamp)
            .context("date must be RFC3339")?
            .with_timezone(&chrono::Utc);
        return Ok(ScheduleSpec::Date { at });
    }
    if let Some(rest) = text.strip_prefix("cron:") {
        let mut parts = rest.splitn(3, ':');
        let hour: u32 = parts
            .next()
            .unwrap_or_default()
            .parse()
            .context("cron hour must be a number")?;
        let minute: u32 = parts
            .next()
            .context("cron trigger needs HH:MM")?
            .parse()
            .context("cron minute must be a number")?;
        let day_of_week = parts.next().map(String::from);
        return Ok(ScheduleSpec::Cron {
            hour,
            minute,
            day_of_week,
        });
    }
    bail!("unknown schedule: {text} (expected immediate|interval:SECS|date:RFC3339|cron:HH:MM[:DOW])")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_shorthand_parses() {
        assert_eq!(
            parse_schedule("immediate").unwrap(),
            ScheduleSpec::Immediate
        );
        assert_eq!(
            parse_schedule("interval:300").unwrap(),
            ScheduleSpec::Interval { secs: 300 }
        );
        assert_eq!(
            parse_schedule("cron:7:30:Mon-Fri").unwrap(),
            ScheduleSpec::Cron {
                hour: 7,
                minute: 30,
                day_of_week: Some("Mon-Fri".into())
            }
        );
        assert!(parse_schedule("every-other-day").is_err());
    }

    #[test]
    fn job_type_parses() {
        assert_eq!(parse_job_type("backup").unwrap(), JobType::Backup);
        assert!(parse_job_type("cron").is_err());
    }
}
