use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use flatwatch_core::SelectionId;
use flatwatch_sync::{open_store, ScanPipeline, SyncConfig};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "flatwatch")]
#[command(about = "Track flat listing prices across scans")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one scan over all (or the given) selections.
    Scan {
        #[arg(long = "selection", value_name = "ID")]
        selections: Vec<SelectionId>,
    },
    /// Apply database migrations.
    Migrate,
    /// Upsert selections from a YAML file.
    SeedSelections {
        #[arg(long, value_name = "PATH")]
        file: Option<PathBuf>,
    },
    /// Run scans on the configured cron expressions until Ctrl-C.
    Schedule,
    /// Serve the JSON report API.
    Serve {
        #[arg(long, value_name = "ADDR")]
        addr: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Scan { selections: vec![] }) {
        Commands::Scan { selections } => {
            let allow_list = (!selections.is_empty()).then_some(selections.as_slice());
            let summary = flatwatch_sync::run_scan_once_from_env(allow_list).await?;
            println!(
                "scan complete: run_id={} scan_at={} selections={} failed={} fetched={} inserted={} deleted={} skipped_currency={}",
                summary.run_id,
                summary.scan_at,
                summary.selections_processed,
                summary.selections_failed,
                summary.listings_fetched,
                summary.inserted,
                summary.deleted,
                summary.skipped_unknown_currency
            );
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env();
            let store = open_store(&config).await?;
            store.close().await;
            println!("migrations applied to {}", config.database_url);
        }
        Commands::SeedSelections { file } => {
            let config = SyncConfig::from_env();
            let path = file.unwrap_or_else(|| config.selections_file.clone());
            let store = open_store(&config).await?;
            let count = flatwatch_sync::seed_selections(&store, &path).await?;
            store.close().await;
            println!("seeded {count} selections from {}", path.display());
        }
        Commands::Schedule => {
            let config = SyncConfig::from_env();
            let store = open_store(&config).await?;
            let pipeline = Arc::new(
                ScanPipeline::from_config(&config, store).context("building scan pipeline")?,
            );
            flatwatch_sync::run_scheduler_until_shutdown(&config, pipeline).await?;
        }
        Commands::Serve { addr } => {
            flatwatch_web::serve_from_env(addr).await?;
        }
    }

    Ok(())
}
