use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use hubsync_core::{SyncRequest, SyncTrigger};
use hubsync_storage::SqliteStore;
use hubsync_sync::{RefreshOutcome, SyncConfig, SyncService};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "hubsync-cli")]
#[command(about = "HubSpot ticket sync command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Pull tickets from HubSpot into the local store.
    Sync {
        /// sync_all, sync_30_days, sync_7_days, sync_1_day or sync_range.
        #[arg(long, default_value = SyncTrigger::LAST_7_DAYS)]
        trigger: String,
        /// Range start (YYYY-MM-DD or RFC 3339), with --trigger sync_range.
        #[arg(long)]
        start: Option<String>,
        #[arg(long)]
        end: Option<String>,
    },
    /// Re-fetch one stored ticket by its HubSpot ID.
    Refresh { id: String },
    RefreshAll,
    Serve,
    Migrate,
    /// Run the cron-scheduled sync until Ctrl-C.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync {
        trigger: SyncTrigger::LAST_7_DAYS.to_string(),
        start: None,
        end: None,
    }) {
        Commands::Sync {
            trigger,
            start,
            end,
        } => {
            let request = SyncRequest {
                trigger,
                start_date: start,
                end_date: end,
            };
            let result = hubsync_sync::run_sync_once_from_env(&request).await?;
            for line in &result.log {
                println!("  {line}");
            }
            println!(
                "sync {}: run_id={} fetched={} processed={} saved={} failed={}",
                if result.success { "complete" } else { "failed" },
                result.run_id,
                result.counts.fetched,
                result.counts.processed,
                result.counts.saved,
                result.counts.failed
            );
            if !result.success {
                bail!(result.message);
            }
        }
        Commands::Refresh { id } => {
            let service = service_from_env().await?;
            match service.refresher().refresh_ticket(&id).await? {
                RefreshOutcome::Refreshed(ticket) => println!(
                    "refreshed ticket {}: stage={} owner={}",
                    ticket.external_id, ticket.pipeline_stage_label, ticket.owner_name
                ),
                RefreshOutcome::NotFound => bail!("ticket {id} not found in HubSpot"),
            }
        }
        Commands::RefreshAll => {
            let service = service_from_env().await?;
            let summary = service.refresher().refresh_all().await?;
            println!(
                "refresh complete: total={} refreshed={} not_found={} failed={}",
                summary.total, summary.refreshed, summary.not_found, summary.failed
            );
        }
        Commands::Serve => {
            hubsync_web::serve_from_env().await?;
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env()?;
            let store = SqliteStore::connect(&config.database_url).await?;
            store.ping().await?;
            info!(database = %config.database_url, "migrations applied");
            println!("database ready: {}", config.database_url);
        }
        Commands::Schedule => {
            let mut config = SyncConfig::from_env()?;
            config.scheduler_enabled = true;
            SyncService::from_config(config).await?.run_scheduler().await?;
        }
    }

    Ok(())
}

async fn service_from_env() -> Result<SyncService> {
    SyncService::from_config(SyncConfig::from_env()?).await
}
