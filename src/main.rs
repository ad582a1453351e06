use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use opsjobs::config::{LogFormat, LoggingConfig, OpsJobsConfig};
use opsjobs::jobs::{
    ExecuteRequest, ExecutionStatus, NewScript, RecordQuery, ScriptId, TriggerKind,
};
use opsjobs::scheduler::{NewSchedule, ScheduleId, ScheduleQuery, ScheduleUpdate};
use opsjobs::OpsJobs;

#[derive(Parser)]
#[command(
    name = "opsjobs",
    about = "Script execution and cron scheduling for cluster operations",
    version,
    long_about = None
)]
struct Cli {
    /// Configuration file (defaults to $OPSJOBS_CONFIG, then /etc/opsjobs/opsjobs.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (scheduler firing enabled schedules)
    Serve,

    /// Run a script once and wait for its terminal status
    Run {
        /// Script id
        script: ScriptId,

        /// Arguments: whitespace-separated words or a JSON array
        #[arg(long, default_value = "")]
        args: String,

        /// Environment overrides as a JSON object
        #[arg(long, default_value = "")]
        env: String,

        /// Timeout in seconds (0 = configured default)
        #[arg(long, default_value = "0")]
        timeout: i64,

        /// Working directory (created if missing)
        #[arg(long, default_value = "")]
        work_dir: String,

        /// Recorded as the requesting user
        #[arg(long, default_value = "")]
        user: String,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Manage scripts
    Script {
        #[command(subcommand)]
        action: ScriptAction,
    },

    /// Manage cron schedules
    Schedule {
        #[command(subcommand)]
        action: ScheduleAction,
    },

    /// Inspect execution records
    Record {
        #[command(subcommand)]
        action: RecordAction,
    },
}

#[derive(Subcommand)]
enum ScriptAction {
    /// Register a script file
    Add {
        /// File name under <storage>/script/<project>/<label>/
        #[arg(long)]
        name: String,

        #[arg(long, default_value = "")]
        project: String,

        #[arg(long, default_value = "")]
        label: String,

        #[arg(long, default_value = "shell")]
        language: String,

        #[arg(long, default_value = "")]
        descr: String,

        /// Resolve under the resource directory and protect from changes
        #[arg(long)]
        builtin: bool,

        /// Register disabled
        #[arg(long)]
        disabled: bool,
    },

    /// List scripts
    List {
        #[arg(long, default_value = "50")]
        limit: u32,

        #[arg(long, default_value = "0")]
        offset: u32,
    },

    /// Allow a script to be executed
    Enable { id: ScriptId },

    /// Reject further executions of a script
    Disable { id: ScriptId },

    /// Delete a script
    Remove { id: ScriptId },
}

#[derive(Subcommand)]
enum ScheduleAction {
    /// List all schedules
    List,

    /// Add a new schedule
    Add {
        /// Schedule name
        #[arg(long)]
        name: String,

        /// Cron expression (5-field, or 6-field with seconds)
        #[arg(long)]
        cron: String,

        /// Script to run
        #[arg(long)]
        script: ScriptId,

        #[arg(long, default_value = "")]
        args: String,

        #[arg(long, default_value = "")]
        env: String,

        #[arg(long, default_value = "")]
        work_dir: String,

        #[arg(long, default_value = "300")]
        timeout: i64,

        /// Retry failed fires
        #[arg(long)]
        retry: bool,

        /// Seconds between attempts
        #[arg(long, default_value = "60")]
        retry_interval: u64,

        /// Retries after the first attempt
        #[arg(long, default_value = "3")]
        max_retries: u32,

        /// Create disabled
        #[arg(long)]
        disabled: bool,

        #[arg(long, default_value = "")]
        user: String,
    },

    /// Change a schedule
    Update {
        id: ScheduleId,

        #[arg(long)]
        cron: Option<String>,

        #[arg(long)]
        enable: bool,

        #[arg(long, conflicts_with = "enable")]
        disable: bool,

        #[arg(long)]
        args: Option<String>,

        #[arg(long)]
        timeout: Option<i64>,

        #[arg(long)]
        retry: Option<bool>,

        #[arg(long)]
        retry_interval: Option<u64>,

        #[arg(long)]
        max_retries: Option<u32>,
    },

    /// Remove a schedule
    Remove { id: ScheduleId },

    /// Show live cron entries with next and previous fire times
    Jobs,

    /// Fire a schedule once now, retries included
    RunOnce { id: ScheduleId },

    /// Preview what will run in the next N hours
    DryRun {
        /// Hours to preview
        #[arg(long, default_value = "24")]
        hours: u64,
    },
}

#[derive(Subcommand)]
enum RecordAction {
    /// List execution records, newest first
    List {
        #[arg(long)]
        script: Option<ScriptId>,

        /// manual, api or cron
        #[arg(long)]
        trigger: Option<TriggerKind>,

        /// pending, running, success, failed, timeout or crashed
        #[arg(long)]
        status: Option<ExecutionStatus>,

        #[arg(long, default_value = "50")]
        limit: u32,

        #[arg(long, default_value = "0")]
        offset: u32,
    },

    /// Show one record and its log
    Show {
        id: u32,

        /// Print the execution log
        #[arg(long)]
        log: bool,
    },
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let resolved = OpsJobsConfig::resolve(cli.config.as_deref())?;
    init_tracing(&resolved.config.logging);
    resolved.log();
    let cfg = resolved.config;

    match cli.command {
        Commands::Serve => {
            tracing::info!("Starting opsjobs daemon");
            opsjobs::serve(&cfg).await?;
        }
        Commands::Run {
            script,
            args,
            env,
            timeout,
            work_dir,
            user,
            json,
        } => {
            let app = OpsJobs::open(&cfg)?;
            let req = ExecuteRequest::new(script, TriggerKind::Manual)
                .with_args(args)
                .with_env(env)
                .with_timeout(timeout)
                .with_work_dir(work_dir)
                .with_username(user);
            let outcome = app.engine.execute_sync(req).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&outcome)?);
            } else {
                println!("Record:    {}", outcome.record_id);
                println!("Status:    {}", outcome.status);
                println!("Exit code: {}", outcome.exit_code);
                println!("Elapsed:   {} ms", outcome.elapsed_ms);
                if !outcome.error_message.is_empty() {
                    println!("Error:     {}", outcome.error_message);
                }
                println!("Log:       {}", outcome.log_path.display());
            }
            if outcome.status != ExecutionStatus::Success {
                bail!(
                    "execution {} finished with status {}",
                    outcome.record_id,
                    outcome.status
                );
            }
        }
        Commands::Script { action } => {
            let app = OpsJobs::open(&cfg)?;
            match action {
                ScriptAction::Add {
                    name,
                    project,
                    label,
                    language,
                    descr,
                    builtin,
                    disabled,
                } => {
                    let script = app
                        .scripts
                        .create(NewScript {
                            name,
                            descr,
                            project,
                            label,
                            language,
                            enabled: !disabled,
                            is_builtin: builtin,
                            username: String::new(),
                        })
                        .await?;
                    println!("Script {} '{}' added.", script.id, script.name);
                }
                ScriptAction::List { limit, offset } => {
                    let (total, scripts) = app.scripts.list(limit, offset).await?;
                    if scripts.is_empty() {
                        println!("No scripts found.");
                    } else {
                        println!(
                            "{:<6} | {:<24} | {:<12} | {:<10} | {:<7} | Builtin",
                            "ID", "Name", "Project", "Label", "Enabled"
                        );
                        println!("{:-<6}-|-{:-<24}-|-{:-<12}-|-{:-<10}-|-{:-<7}-|-{:-<7}", "", "", "", "", "", "");
                        for s in scripts {
                            println!(
                                "{:<6} | {:<24} | {:<12} | {:<10} | {:<7} | {}",
                                s.id, s.name, s.project, s.label, s.enabled, s.is_builtin
                            );
                        }
                        println!("({} total)", total);
                    }
                }
                ScriptAction::Enable { id } => {
                    app.scripts.set_enabled(id, true).await?;
                    println!("Script {} enabled.", id);
                }
                ScriptAction::Disable { id } => {
                    app.scripts.set_enabled(id, false).await?;
                    println!("Script {} disabled.", id);
                }
                ScriptAction::Remove { id } => {
                    app.scripts.delete(id).await?;
                    println!("Script {} removed.", id);
                }
            }
        }
        Commands::Schedule { action } => {
            let app = OpsJobs::open(&cfg)?;
            let scheduler = &app.scheduler;

            match action {
                ScheduleAction::List => {
                    let (_, list) = scheduler
                        .list_schedules(ScheduleQuery {
                            limit: u32::MAX,
                            ..Default::default()
                        })
                        .await?;
                    if list.is_empty() {
                        println!("No schedules found.");
                    } else {
                        println!(
                            "{:<6} | {:<20} | {:<15} | {:<6} | {:<7} | Retries",
                            "ID", "Name", "Cron", "Script", "Enabled"
                        );
                        println!("{:-<6}-|-{:-<20}-|-{:-<15}-|-{:-<6}-|-{:-<7}-|-{:-<7}", "", "", "", "", "", "");
                        for s in list {
                            let retries = if s.is_retry {
                                format!("{} every {}s", s.max_retries, s.retry_interval_secs)
                            } else {
                                "off".to_string()
                            };
                            println!(
                                "{:<6} | {:<20} | {:<15} | {:<6} | {:<7} | {}",
                                s.id, s.name, s.specification, s.script_id, s.is_enabled, retries
                            );
                        }
                    }
                }
                ScheduleAction::Add {
                    name,
                    cron,
                    script,
                    args,
                    env,
                    work_dir,
                    timeout,
                    retry,
                    retry_interval,
                    max_retries,
                    disabled,
                    user,
                } => {
                    let mut new = NewSchedule::new(name, cron, script);
                    new.command_args = args;
                    new.env_vars = env;
                    new.work_dir = work_dir;
                    new.timeout_secs = timeout;
                    new.is_retry = retry;
                    new.retry_interval_secs = retry_interval;
                    new.max_retries = max_retries;
                    new.is_enabled = !disabled;
                    new.username = user;
                    let schedule = scheduler.create_schedule(new).await?;
                    println!("Schedule {} '{}' added.", schedule.id, schedule.name);
                }
                ScheduleAction::Update {
                    id,
                    cron,
                    enable,
                    disable,
                    args,
                    timeout,
                    retry,
                    retry_interval,
                    max_retries,
                } => {
                    let is_enabled = match (enable, disable) {
                        (true, _) => Some(true),
                        (_, true) => Some(false),
                        _ => None,
                    };
                    let schedule = scheduler
                        .update_schedule(
                            id,
                            ScheduleUpdate {
                                specification: cron,
                                is_enabled,
                                command_args: args,
                                timeout_secs: timeout,
                                is_retry: retry,
                                retry_interval_secs: retry_interval,
                                max_retries,
                                ..Default::default()
                            },
                        )
                        .await?;
                    println!(
                        "Schedule {} updated ({}, enabled: {}).",
                        schedule.id, schedule.specification, schedule.is_enabled
                    );
                }
                ScheduleAction::Remove { id } => {
                    scheduler.delete_schedule(id).await?;
                    println!("Schedule {} removed.", id);
                }
                ScheduleAction::Jobs => {
                    scheduler.load_enabled().await?;
                    let jobs = scheduler.list_schedule_jobs();
                    if jobs.is_empty() {
                        println!("No live cron entries.");
                    } else {
                        println!("{:<6} | {:<8} | {:<15} | Next run", "Entry", "Schedule", "Cron");
                        println!("{:-<6}-|-{:-<8}-|-{:-<15}-|-{:-<25}", "", "", "", "");
                        for job in jobs {
                            let next = job
                                .next_run
                                .map(|t| t.to_rfc3339())
                                .unwrap_or_else(|| "-".to_string());
                            println!(
                                "{:<6} | {:<8} | {:<15} | {}",
                                job.entry_id, job.schedule_id, job.specification, next
                            );
                        }
                    }
                }
                ScheduleAction::RunOnce { id } => {
                    let schedule = scheduler.find_schedule(id).await?;
                    let report = scheduler.run_schedule_once(&schedule).await;
                    println!("{}", serde_json::to_string_pretty(&report)?);
                    if !report.succeeded() {
                        bail!(
                            "schedule {} failed after {} attempt(s)",
                            id,
                            report.attempts
                        );
                    }
                }
                ScheduleAction::DryRun { hours } => {
                    let preview = scheduler.preview_next_runs(hours).await?;
                    if preview.is_empty() {
                        println!("No runs scheduled in next {} hours.", hours);
                    } else {
                        println!("Upcoming runs (next {} hours):", hours);
                        for run in preview {
                            println!(
                                "{} : {} (schedule {}, script {})",
                                run.at.to_rfc3339(),
                                run.name,
                                run.schedule_id,
                                run.script_id
                            );
                        }
                    }
                }
            }
            scheduler.shutdown().await;
        }
        Commands::Record { action } => {
            let app = OpsJobs::open(&cfg)?;
            match action {
                RecordAction::List {
                    script,
                    trigger,
                    status,
                    limit,
                    offset,
                } => {
                    let (total, records) = app
                        .engine
                        .list_records(RecordQuery {
                            script_id: script,
                            trigger,
                            status,
                            limit,
                            offset,
                        })
                        .await?;
                    if records.is_empty() {
                        println!("No records found.");
                    } else {
                        println!(
                            "{:<6} | {:<6} | {:<7} | {:<8} | {:<4} | Created",
                            "ID", "Script", "Trigger", "Status", "Exit"
                        );
                        println!("{:-<6}-|-{:-<6}-|-{:-<7}-|-{:-<8}-|-{:-<4}-|-{:-<25}", "", "", "", "", "", "");
                        for r in records {
                            println!(
                                "{:<6} | {:<6} | {:<7} | {:<8} | {:<4} | {}",
                                r.id,
                                r.script_id,
                                r.trigger,
                                r.status,
                                r.exit_code,
                                r.created_at.to_rfc3339()
                            );
                        }
                        println!("({} total)", total);
                    }
                }
                RecordAction::Show { id, log } => {
                    let record = app.engine.find_record(id).await?;
                    println!("{}", serde_json::to_string_pretty(&record)?);
                    if log {
                        let path = app.engine.log_path(&record);
                        match std::fs::read_to_string(&path) {
                            Ok(content) => print!("{}", content),
                            Err(e) => bail!("cannot read log {}: {}", path.display(), e),
                        }
                    }
                }
            }
        }
    }

    Ok(())
}
