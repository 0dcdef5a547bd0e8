use std::sync::Arc;

use adpulse_storage::PgStore;
use adpulse_sync::{build_scheduler, Orchestrator, SyncConfig};
use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "adpulse-cli")]
#[command(about = "Ads and CRM sync engine")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Sync one company now.
    Sync {
        #[arg(long)]
        company: Uuid,
        /// First day of the ads window (YYYY-MM-DD).
        #[arg(long)]
        since: Option<NaiveDate>,
        /// Last day of the ads window (YYYY-MM-DD).
        #[arg(long)]
        until: Option<NaiveDate>,
    },
    /// Sync every company with an active integration.
    SyncAll,
    Migrate,
    /// Serve the webhook and force-sync routes.
    Serve,
    /// Run the cron scheduler until interrupted.
    Schedule,
}

async fn connect(config: &SyncConfig) -> Result<PgStore> {
    PgStore::connect(&config.database_url)
        .await
        .context("connecting to postgres")
}

async fn orchestrator(config: &SyncConfig) -> Result<Arc<Orchestrator>> {
    let store = connect(config).await?;
    Ok(Arc::new(Orchestrator::from_config(config, Arc::new(store))?))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::SyncAll) {
        Commands::Sync {
            company,
            since,
            until,
        } => {
            let orchestrator = orchestrator(&config).await?;
            let range = orchestrator.resolve_window(since, until)?;
            let report = orchestrator.sync_company(company, range).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if report.has_errors() {
                bail!("one or more sources failed for company {company}");
            }
        }
        Commands::SyncAll => {
            let orchestrator = orchestrator(&config).await?;
            let reports = orchestrator.sync_all_active_companies().await?;
            let failed = reports.iter().filter(|r| r.has_errors()).count();
            println!(
                "sync complete: companies={} with_errors={}",
                reports.len(),
                failed
            );
        }
        Commands::Migrate => {
            connect(&config).await?.migrate().await?;
            println!("migrations applied");
        }
        Commands::Serve => {
            adpulse_web::serve_from_env().await?;
        }
        Commands::Schedule => {
            let orchestrator = orchestrator(&config).await?;
            let mut sched = build_scheduler(&config.sync_cron, orchestrator).await?;
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.sync_cron, "scheduler running; press ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}
