use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{NaiveDate, NaiveDateTime, Utc};
use clap::{Parser, Subcommand};
use parlsync_core::SyncMode;
use parlsync_sync::{
    maybe_build_scheduler, FilterPresets, MemoryRecordStore, PgRecordStore, RecordStore, SyncConfig,
    SyncOrchestrator, SyncRequest, SyncRunSummary,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "parlsync-cli")]
#[command(about = "Parliamentary records sync")]
struct Cli {
    /// Keep records in memory instead of writing to the database.
    #[arg(long, global = true)]
    dry_run: bool,

    /// Print run summaries as JSON.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Import printed papers in one of the run modes: full, new or missing.
    Sync {
        mode: SyncMode,
        #[arg(long)]
        date_start: Option<NaiveDate>,
        #[arg(long)]
        date_end: Option<NaiveDate>,
        /// Lower bound for `new`, e.g. 2024-03-01T08:00:00. Defaults to 30 minutes ago.
        #[arg(long)]
        since: Option<NaiveDateTime>,
    },
    /// Import vote results listed in the window.
    Votes {
        #[arg(long)]
        date_start: NaiveDate,
        #[arg(long)]
        date_end: NaiveDate,
    },
    /// Import plenary session records of the window.
    Protocols {
        #[arg(long)]
        date_start: NaiveDate,
        #[arg(long)]
        date_end: NaiveDate,
    },
    /// Apply database migrations.
    Migrate,
    /// Run the startup gap-fill and the incremental cron until interrupted.
    Schedule,
}

#[tokio::main]
async fn main() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    if let Err(err) = run(Cli::parse()).await {
        error!(error = %format!("{err:#}"), "parlsync-cli failed");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = SyncConfig::from_env();

    match cli.command {
        Commands::Sync {
            mode,
            date_start,
            date_end,
            since,
        } => {
            let updated_since = match mode {
                SyncMode::Incremental => since.or_else(|| SyncRequest::recent(Utc::now()).updated_since),
                _ => None,
            };
            let request = SyncRequest {
                mode,
                date_start,
                date_end,
                updated_since,
            };
            let summary = orchestrator(config, cli.dry_run).await?.run(&request).await?;
            print_summary(&summary, cli.json)?;
        }
        Commands::Votes { date_start, date_end } => {
            let imported = orchestrator(config, cli.dry_run)
                .await?
                .import_votes(date_start, date_end)
                .await?;
            println!("votes imported: {imported}");
        }
        Commands::Protocols { date_start, date_end } => {
            let imported = orchestrator(config, cli.dry_run)
                .await?
                .import_protocols(date_start, date_end)
                .await?;
            println!("plenary protocols imported: {imported}");
        }
        Commands::Migrate => {
            let store = PgRecordStore::connect(&config.database_url)
                .await
                .context("connecting to database")?;
            store.migrate().await?;
            println!("migrations applied");
        }
        Commands::Schedule => {
            let orchestrator = orchestrator(config, cli.dry_run).await?;
            let Some(mut sched) = maybe_build_scheduler(orchestrator).await? else {
                anyhow::bail!("scheduler disabled, set PARLSYNC_SCHEDULER_ENABLED=true");
            };
            sched.start().await.context("starting scheduler")?;
            info!("scheduler running, press ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}

async fn orchestrator(config: SyncConfig, dry_run: bool) -> Result<Arc<SyncOrchestrator>> {
    let filters = FilterPresets::load(&config.filters_path).await?;
    let store: Arc<dyn RecordStore> = if dry_run {
        info!("dry run, records stay in memory");
        Arc::new(MemoryRecordStore::new())
    } else {
        Arc::new(
            PgRecordStore::connect(&config.database_url)
                .await
                .context("connecting to database")?,
        )
    };
    Ok(Arc::new(SyncOrchestrator::new(config, filters, store)))
}

fn print_summary(summary: &SyncRunSummary, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(summary)?);
    } else {
        println!(
            "sync complete: run_id={} mode={} parameters={} imported={} dependent={}",
            summary.run_id, summary.mode, summary.parameters, summary.imported, summary.dependent_imported
        );
    }
    Ok(())
}
