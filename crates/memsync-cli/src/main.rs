use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use memsync_core::{format_timestamp, parse_timestamp};
use memsync_storage::TimestampStore;
use memsync_sync::{connect_pool, run_migrations, PgParamStore, RunSummary, SyncConfig};
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "info,memsync_sync=info";

#[derive(Debug, Parser)]
#[command(name = "memsync-cli")]
#[command(about = "Billing provider member synchronizer")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one synchronization pass until caught up or a fatal error.
    Sync {
        #[arg(long)]
        json: bool,
    },
    /// Show the windows the next run would request.
    Plan,
    Checkpoint {
        #[command(subcommand)]
        action: CheckpointAction,
    },
    Migrate,
}

#[derive(Debug, Subcommand)]
enum CheckpointAction {
    Show,
    /// Overwrite the checkpoint, e.g. `2024-01-01 00:00:00`.
    Set { value: String },
}

fn init_tracing(log_file: Option<&Path>) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
    Ok(())
}

fn print_summary(summary: &RunSummary) {
    let checkpoint = summary
        .checkpoint_after
        .map(format_timestamp)
        .unwrap_or_else(|| "-".to_string());
    println!(
        "sync {:?}: run_id={} windows={} records={} checkpoint={}",
        summary.status,
        summary.run_id,
        summary.windows_committed,
        summary.records_committed,
        checkpoint
    );
    if let Some(error) = &summary.error {
        println!("error: {error}");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = SyncConfig::from_env()?;
    init_tracing(config.log_file.as_deref())?;

    match cli.command.unwrap_or(Commands::Sync { json: false }) {
        Commands::Sync { json } => {
            let summary = memsync_sync::run_sync_once(&config).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                print_summary(&summary);
            }
            if summary.is_failed() {
                bail!(
                    "sync run {} failed: {}",
                    summary.run_id,
                    summary.error.as_deref().unwrap_or("unknown error")
                );
            }
        }
        Commands::Plan => {
            let plan = memsync_sync::plan_next_run(&config).await?;
            println!(
                "checkpoint={} ceiling={} windows={}",
                format_timestamp(plan.checkpoint),
                format_timestamp(plan.ceiling),
                plan.windows.len()
            );
            for window in &plan.windows {
                println!("  {window}");
            }
        }
        Commands::Checkpoint { action } => {
            let pool = connect_pool(&config.database_url, config.db_max_connections).await?;
            let store = PgParamStore::checkpoint(pool);
            match action {
                CheckpointAction::Show => match store.load().await? {
                    Some(value) => println!("{}", format_timestamp(value)),
                    None => bail!("checkpoint row {:?} is missing", store.param()),
                },
                CheckpointAction::Set { value } => {
                    let value = parse_timestamp(value.trim())?;
                    store.store(value).await?;
                    tracing::info!(checkpoint = %format_timestamp(value), "checkpoint overwritten");
                    println!("checkpoint set to {}", format_timestamp(value));
                }
            }
        }
        Commands::Migrate => {
            let pool = connect_pool(&config.database_url, config.db_max_connections).await?;
            run_migrations(&pool).await?;
            println!("migrations applied");
        }
    }

    Ok(())
}
