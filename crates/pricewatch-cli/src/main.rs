use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use pricewatch_core::{CompetitorId, TriggerType};
use pricewatch_storage::PgStore;
use pricewatch_sync::{RunOutcome, SyncConfig};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "pricewatch-cli")]
#[command(about = "Competitor price reconciliation")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one manual reconciliation pass.
    Reconcile {
        #[arg(long)]
        competitor: Option<CompetitorId>,
        #[arg(long)]
        only_new: bool,
        /// Products per competitor; 0 means all.
        #[arg(long)]
        batch_size: Option<usize>,
        /// Run date (YYYY-MM-DD), defaults to today in UTC.
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Regenerate alerts for one competitor from stored snapshots.
    Alerts {
        #[arg(long)]
        competitor: CompetitorId,
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Apply database migrations.
    Migrate,
    /// Run on the configured cron until Ctrl-C.
    Schedule,
    /// Mark a run left running by a crashed process as failed.
    AbandonRun { run_id: Uuid },
}

fn print_outcome(outcome: &RunOutcome) {
    match outcome {
        RunOutcome::Completed { run, summary } => {
            println!(
                "reconcile complete: run_id={} status={} {}",
                run.id,
                run.status,
                summary.counters_line()
            );
            for message in &summary.messages {
                println!("  {message}");
            }
            if summary.dropped_messages > 0 {
                println!("  ... {} more", summary.dropped_messages);
            }
        }
        RunOutcome::AlreadyRunning => {
            println!("reconcile refused: another run is already in progress");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Reconcile {
        competitor: None,
        only_new: false,
        batch_size: None,
        date: None,
    }) {
        Commands::Reconcile {
            competitor,
            only_new,
            batch_size,
            date,
        } => {
            let pipeline = pricewatch_sync::pipeline_from_env().await?;
            let run_date = date.unwrap_or_else(|| Utc::now().date_naive());
            let mut options = pipeline.default_options(run_date);
            options.competitor = competitor;
            options.only_new |= only_new;
            if let Some(batch_size) = batch_size {
                options.batch_size = batch_size;
            }

            let shutdown = pipeline.shutdown_token();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received; stopping after the current product");
                    shutdown.cancel();
                }
            });

            let outcome = pipeline.run_once(TriggerType::Manual, &options).await?;
            print_outcome(&outcome);
        }
        Commands::Alerts { competitor, date } => {
            let pipeline = pricewatch_sync::pipeline_from_env().await?;
            let date = date.unwrap_or_else(|| Utc::now().date_naive());
            let inserted = pipeline.generate_alerts(competitor, date).await?;
            println!("alerts complete: competitor={competitor} date={date} inserted={inserted}");
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env();
            let store = PgStore::connect(&config.database_url).await?;
            store.migrate().await?;
            println!("migrations applied");
        }
        Commands::Schedule => {
            let pipeline = Arc::new(pricewatch_sync::pipeline_from_env().await?);
            let mut sched = pipeline.build_scheduler().await?;
            sched.start().await.context("starting scheduler")?;
            info!(cron = %pipeline.config().run_cron, "scheduler started");

            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            info!("shutting down scheduler");
            pipeline.shutdown_token().cancel();
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::AbandonRun { run_id } => {
            let pipeline = pricewatch_sync::pipeline_from_env().await?;
            pipeline.abandon_run(run_id).await?;
            println!("run {run_id} marked failed");
        }
    }

    Ok(())
}
