use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Result};
use chrono::{DateTime, Local, Utc};
use clap::{Parser, Subcommand, ValueEnum};

use runledger::config::AppConfig;
use runledger::ledger::{Interval, IntervalUnit, Trigger};
use runledger::supervisor::{RunOptions, RunOutcome};
use runledger::Services;

#[derive(Parser)]
#[command(
    name = "runledger",
    about = "Run, queue and schedule jobs with a crash-recoverable execution ledger",
    version,
    long_about = None
)]
struct Cli {
    /// Configuration file (default: $RUNLEDGER_CONFIG, then ./runledger.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (HTTP control surface + scheduler)
    Serve {
        /// Bind address, overrides [server] bind
        #[arg(long)]
        bind: Option<String>,
    },

    /// List the job catalog
    Jobs,

    /// Run a job in the foreground and stream its output
    Run {
        /// Job id from the catalog
        job: String,

        /// Positional input passed to the job
        #[arg(long)]
        input: Option<String>,

        /// Ask the job not to make changes
        #[arg(long)]
        dry_run: bool,
    },

    /// Manage recurring schedules
    Schedule {
        #[command(subcommand)]
        action: ScheduleAction,
    },

    /// Show recent executions
    History {
        #[arg(long, default_value = "20")]
        limit: u32,
    },

    /// Show execution statistics
    Stats,

    /// Delete finished executions older than N days
    Cleanup {
        /// Defaults to [storage] retention_days
        #[arg(long)]
        days: Option<u32>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Unit {
    Minutes,
    Hours,
    Days,
}

impl From<Unit> for IntervalUnit {
    fn from(u: Unit) -> Self {
        match u {
            Unit::Minutes => IntervalUnit::Minutes,
            Unit::Hours => IntervalUnit::Hours,
            Unit::Days => IntervalUnit::Days,
        }
    }
}

#[derive(Subcommand)]
enum ScheduleAction {
    /// List all schedules
    List,

    /// Schedule a job every N units
    Add {
        job: String,
        #[arg(long, value_enum)]
        every: Unit,
        #[arg(long)]
        value: u32,
        /// First run (RFC 3339); defaults to now
        #[arg(long)]
        next_run: Option<DateTime<Utc>>,
    },

    /// Change a schedule's interval
    Update {
        job: String,
        #[arg(long, value_enum)]
        every: Unit,
        #[arg(long)]
        value: u32,
        /// Next run (RFC 3339); defaults to one interval from now
        #[arg(long)]
        next_run: Option<DateTime<Utc>>,
    },

    /// Remove a schedule
    Remove { job: String },

    /// Enable a schedule
    Enable { job: String },

    /// Disable a schedule
    Disable { job: String },
}

fn init_tracing(config: &AppConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if config.logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let mut config = AppConfig::resolve(cli.config.as_deref())?;
    init_tracing(&config);

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            tracing::info!(bind = %config.server.bind, "starting runledger daemon");
            runledger::serve(config).await?;
        }
        Commands::Jobs => {
            let catalog = config.catalog()?;
            if catalog.is_empty() {
                println!("No jobs configured.");
            }
            for section in catalog.sections() {
                println!("[{section}]");
                for job in catalog.list().iter().filter(|j| j.section == section) {
                    let mut flags = Vec::new();
                    if job.supports_dry_run {
                        flags.push("dry-run");
                    }
                    if job.accepts_input {
                        flags.push("input");
                    }
                    println!(
                        "  {:<20} {:<30} {}",
                        job.id,
                        job.display_name(),
                        flags.join(",")
                    );
                }
            }
        }
        Commands::Run {
            job,
            input,
            dry_run,
        } => return run_foreground(&config, &job, input, dry_run).await,
        Commands::Schedule { action } => {
            let services = Services::build(&config).await?;
            let scheduler = &services.scheduler;
            match action {
                ScheduleAction::List => {
                    let list = scheduler.list().await?;
                    if list.is_empty() {
                        println!("No schedules found.");
                    } else {
                        println!(
                            "{:<20} | {:<18} | {:<7} | {:<25} | Runs (errors)",
                            "Job", "Interval", "Enabled", "Next run"
                        );
                        println!(
                            "{:-<20}-|-{:-<18}-|-{:-<7}-|-{:-<25}-|-{:-<13}",
                            "", "", "", "", ""
                        );
                        for job in list {
                            let next = job
                                .next_run
                                .map(|t| {
                                    t.with_timezone(&Local)
                                        .format("%Y-%m-%d %H:%M:%S")
                                        .to_string()
                                })
                                .unwrap_or_else(|| "now".to_string());
                            println!(
                                "{:<20} | {:<18} | {:<7} | {:<25} | {} ({})",
                                job.job_id,
                                job.interval.to_string(),
                                job.enabled,
                                next,
                                job.run_count,
                                job.error_count
                            );
                        }
                    }
                }
                ScheduleAction::Add {
                    job,
                    every,
                    value,
                    next_run,
                } => {
                    let added = scheduler
                        .add(&job, Interval::new(every.into(), value), next_run)
                        .await?;
                    println!("Scheduled '{}' {}.", added.job_id, added.interval);
                }
                ScheduleAction::Update {
                    job,
                    every,
                    value,
                    next_run,
                } => {
                    let updated = scheduler
                        .update_schedule(&job, Interval::new(every.into(), value), next_run)
                        .await?;
                    println!("Schedule '{}' now runs {}.", updated.job_id, updated.interval);
                }
                ScheduleAction::Remove { job } => {
                    scheduler.remove(&job).await?;
                    println!("Schedule '{job}' removed.");
                }
                ScheduleAction::Enable { job } => {
                    scheduler.enable(&job).await?;
                    println!("Schedule '{job}' enabled.");
                }
                ScheduleAction::Disable { job } => {
                    scheduler.disable(&job).await?;
                    println!("Schedule '{job}' disabled.");
                }
            }
        }
        Commands::History { limit } => {
            let services = Services::build(&config).await?;
            let rows = services.ledger.recent_executions(limit).await?;
            if rows.is_empty() {
                println!("No executions recorded.");
            }
            for e in rows {
                println!(
                    "#{:<6} {:<20} {:<10} {:<9} {:<19} {:>8} {}",
                    e.id,
                    e.job_id,
                    e.status.as_str(),
                    e.triggered_by.as_str(),
                    e.start_time.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S"),
                    e.duration_seconds
                        .map(|d| format!("{d:.1}s"))
                        .unwrap_or_default(),
                    e.error_message.unwrap_or_default()
                );
            }
        }
        Commands::Stats => {
            let services = Services::build(&config).await?;
            let stats = services.ledger.stats().await?;
            println!("Total executions: {}", stats.total_executions);
            println!("Success rate:     {:.1}%", stats.success_rate);
            if !stats.most_used.is_empty() {
                println!("Most used:");
                for usage in stats.most_used {
                    println!("  {:<20} {}", usage.job_id, usage.count);
                }
            }
        }
        Commands::Cleanup { days } => {
            let services = Services::build(&config).await?;
            let days = days.unwrap_or(config.storage.retention_days);
            let deleted = services.ledger.cleanup_older_than(days).await?;
            println!("Deleted {deleted} executions older than {days} days.");
        }
    }

    Ok(ExitCode::SUCCESS)
}

/// Run one job in this process, printing its buffered output as it arrives.
/// The exit status mirrors the job's.
async fn run_foreground(
    config: &AppConfig,
    job_id: &str,
    input: Option<String>,
    dry_run: bool,
) -> Result<ExitCode> {
    let services = Services::build(config).await?;
    let Some(job) = services.catalog.get(job_id).cloned() else {
        bail!("unknown job {job_id}");
    };
    // Orphan healing belongs to `serve`; a daemon may own running rows.

    let handle = services
        .supervisor
        .run(
            &job,
            RunOptions {
                input,
                dry_run,
                trigger: Trigger::Manual,
            },
        )
        .await?;
    tracing::info!(job_id, execution_id = handle.execution_id, "job running");

    let mut wait = std::pin::pin!(handle.wait());
    let mut cursor = 0u64;
    let mut ticker = tokio::time::interval(std::time::Duration::from_millis(200));
    let report = loop {
        tokio::select! {
            report = &mut wait => break report,
            _ = ticker.tick() => {
                cursor = print_new_output(&services, job_id, cursor).await;
            }
        }
    };
    print_new_output(&services, job_id, cursor).await;

    let code = match &report.outcome {
        RunOutcome::Completed => 0,
        other => other.return_code().unwrap_or(1).clamp(1, 255),
    };
    Ok(ExitCode::from(code as u8))
}

/// Print lines buffered since `cursor` and return the new cursor.
async fn print_new_output(services: &Services, job_id: &str, cursor: u64) -> u64 {
    let chunk = services.supervisor.output_since(job_id, cursor).await;
    if chunk.skipped > 0 {
        eprintln!("... {} lines dropped from the output buffer", chunk.skipped);
    }
    for line in &chunk.lines {
        println!("{line}");
    }
    chunk.cursor
}
