use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use pncp_client::TenderEndpoint;
use pncp_core::DateRange;
use pncp_sync::SyncConfig;
use pncp_web::{AppState, SyncRunner};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "pncp-cli")]
#[command(about = "PNCP tender synchronization command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Walk the publication endpoint for a date range across all modalities.
    Sync {
        #[arg(long)]
        data_inicial: String,
        #[arg(long)]
        data_final: String,
    },
    /// Walk the update endpoint; defaults to yesterday through today.
    Delta {
        #[arg(long)]
        data_inicial: Option<String>,
        #[arg(long)]
        data_final: Option<String>,
    },
    /// Apply pending database migrations.
    Migrate,
    /// Serve the HTTP trigger endpoints (plus the scheduler when enabled).
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Sync {
            data_inicial,
            data_final,
        } => {
            let range = DateRange::parse(&data_inicial, &data_final)?;
            let summary = pncp_sync::run_once_from_env(TenderEndpoint::Publication, range).await?;
            println!(
                "sync finished: run_id={} pages={} created={} updated={} rejected={}",
                summary.run_id, summary.pages, summary.created, summary.updated, summary.rejected
            );
        }
        Commands::Delta {
            data_inicial,
            data_final,
        } => {
            let range = match (data_inicial, data_final) {
                (Some(start), Some(end)) => DateRange::parse(&start, &end)?,
                (None, None) => DateRange::last_day(Utc::now().date_naive()),
                _ => anyhow::bail!("--data-inicial and --data-final must be given together"),
            };
            let summary = pncp_sync::run_once_from_env(TenderEndpoint::Update, range).await?;
            println!(
                "delta finished: run_id={} pages={} created={} updated={} unchanged={}",
                summary.run_id, summary.pages, summary.created, summary.updated, summary.unchanged
            );
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env();
            let pool = pncp_storage::connect(&config.database_url)
                .await
                .context("connecting to database")?;
            pncp_storage::run_migrations(&pool)
                .await
                .context("applying migrations")?;
            println!("migrations applied");
        }
        Commands::Serve => {
            let config = SyncConfig::from_env();
            let pipeline = Arc::new(pncp_sync::pipeline_from_env(&config).await?);

            if let Some(scheduler) =
                pncp_sync::maybe_build_scheduler(Arc::clone(&pipeline), &config).await?
            {
                scheduler.start().await.context("starting scheduler")?;
            }

            let state = AppState::new(pipeline as Arc<dyn SyncRunner>);
            pncp_web::serve_from_env(state).await?;
        }
    }

    Ok(())
}
