//! Gathering CLI entry point.

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use comfy_table::Table;
use std::time::Duration;
use uuid::Uuid;

use gathering::domain::models::BackgroundTaskStatus;
use gathering::domain::ports::BackgroundTaskRepository;
use gathering::infrastructure::config::ConfigLoader;
use gathering::infrastructure::logging;
use gathering::CoreContext;

#[derive(Parser)]
#[command(name = "gathering", version, about = "Multi-agent gathering circle orchestrator")]
struct Cli {
    /// Load configuration from a specific file instead of .gathering/.
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the orchestration daemon (scheduler + executor).
    Daemon,
    /// Recover orphaned background tasks, print the count, and exit.
    Recover,
    /// Inspect background tasks.
    Task {
        #[command(subcommand)]
        command: TaskCommands,
    },
    /// Manage scheduled actions.
    Schedule {
        #[command(subcommand)]
        command: ScheduleCommands,
    },
}

#[derive(Subcommand)]
enum TaskCommands {
    /// List background tasks, optionally filtered by status.
    List {
        #[arg(long)]
        status: Option<String>,
    },
}

#[derive(Subcommand)]
enum ScheduleCommands {
    /// List all scheduled actions.
    List,
    /// Pause an action.
    Pause { id: Uuid },
    /// Resume a paused action.
    Resume { id: Uuid },
    /// Fire an action immediately.
    Trigger { id: Uuid },
    /// Delete an action.
    Delete { id: Uuid },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => ConfigLoader::load_from_file(path)?,
        None => ConfigLoader::load()?,
    };
    let _log_guard = logging::init(&config.logging)?;

    let ctx = CoreContext::initialize(config).await.context("failed to initialize core")?;

    match cli.command {
        Commands::Daemon => {
            let recovered = ctx.start().await?;
            if recovered > 0 {
                tracing::info!(recovered, "parked orphaned background tasks as paused");
            }
            tracing::info!("daemon running, press ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
            tracing::info!("shutting down");
            ctx.shutdown(Duration::from_secs(30)).await;
        }
        Commands::Recover => {
            let recovered = ctx.executor.recover_tasks().await?;
            println!("recovered {recovered} task(s)");
        }
        Commands::Task { command } => match command {
            TaskCommands::List { status } => {
                let status = match status.as_deref() {
                    Some(s) => Some(
                        BackgroundTaskStatus::from_str(s)
                            .with_context(|| format!("unknown status: {s}"))?,
                    ),
                    None => None,
                };
                let tasks = match status {
                    Some(status) => ctx.background_tasks.list_by_status(status).await?,
                    None => {
                        let mut all = Vec::new();
                        for status in [
                            BackgroundTaskStatus::Pending,
                            BackgroundTaskStatus::Running,
                            BackgroundTaskStatus::Paused,
                            BackgroundTaskStatus::Completed,
                            BackgroundTaskStatus::Failed,
                            BackgroundTaskStatus::Timeout,
                            BackgroundTaskStatus::Cancelled,
                        ] {
                            all.extend(ctx.background_tasks.list_by_status(status).await?);
                        }
                        all
                    }
                };

                let mut table = Table::new();
                table.set_header(["id", "agent", "status", "step", "goal"]);
                for task in tasks {
                    table.add_row([
                        task.id.to_string(),
                        task.agent_id.to_string(),
                        task.status.to_string(),
                        format!("{}/{}", task.current_step, task.max_steps),
                        truncate(&task.goal, 48),
                    ]);
                }
                println!("{table}");
            }
        },
        Commands::Schedule { command } => match command {
            ScheduleCommands::List => {
                let actions = ctx.scheduler.actions().await?;
                let mut table = Table::new();
                table.set_header(["id", "name", "schedule", "status", "runs", "next run"]);
                for action in actions {
                    table.add_row([
                        action.id.to_string(),
                        action.name.clone(),
                        action.schedule.description(),
                        action.status.as_str().to_string(),
                        action.execution_count.to_string(),
                        action
                            .next_run_at
                            .map(|dt| dt.format("%Y-%m-%d %H:%M UTC").to_string())
                            .unwrap_or_else(|| "-".to_string()),
                    ]);
                }
                println!("{table}");
            }
            ScheduleCommands::Pause { id } => {
                ctx.scheduler.pause_action(id).await?;
                println!("paused {id}");
            }
            ScheduleCommands::Resume { id } => {
                ctx.scheduler.resume_action(id).await?;
                println!("resumed {id}");
            }
            ScheduleCommands::Trigger { id } => {
                let run_id = ctx.scheduler.trigger_now(id).await?;
                println!("triggered {id} (run {run_id})");
            }
            ScheduleCommands::Delete { id } => {
                ctx.scheduler.delete_action(id).await?;
                println!("deleted {id}");
            }
        },
    }

    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let mut out: String = s.chars().take(max).collect();
        out.push('…');
        out
    }
}
