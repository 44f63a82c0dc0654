use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use profsync_sync::{maybe_build_scheduler, RunMode, RunSummary, SyncConfig, SyncRunner};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "profsync")]
#[command(about = "Profile snapshot sync command-line interface")]
struct Cli {
    /// Run against an in-memory table instead of the remote store.
    #[arg(long, global = true)]
    dry_run: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Sweep the currently-online users.
    Online,
    /// Drain pending rows from the target queue.
    Targets,
    /// Keep draining the target queue on the configured cron cadence.
    Schedule,
}

fn print_summary(summary: &RunSummary) {
    let metrics = &summary.metrics;
    println!(
        "sync complete: run={} mode={:?} processed={} success={} failed={} \
         new={} updated={} unchanged={} rate={:.1}%",
        summary.run_id,
        summary.mode,
        metrics.processed,
        metrics.succeeded,
        metrics.failed,
        metrics.new,
        metrics.updated,
        metrics.unchanged,
        metrics.success_rate()
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let mut config = SyncConfig::from_env();
    if cli.dry_run {
        config.dry_run = true;
    }

    match cli.command.unwrap_or(Commands::Targets) {
        Commands::Online => {
            let runner = SyncRunner::from_config(config)?;
            let summary = runner.run(RunMode::Online).await?;
            print_summary(&summary);
        }
        Commands::Targets => {
            let runner = SyncRunner::from_config(config)?;
            let summary = runner.run(RunMode::Targets).await?;
            print_summary(&summary);
        }
        Commands::Schedule => {
            config.scheduler_enabled = true;
            let runner = Arc::new(SyncRunner::from_config(config)?);
            let scheduler = maybe_build_scheduler(Arc::clone(&runner))
                .await?
                .context("scheduler was not built")?;
            scheduler.start().await.context("starting scheduler")?;
            info!(cron = runner.config().target_cron.as_str(), "scheduler running, ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
        }
    }

    Ok(())
}
