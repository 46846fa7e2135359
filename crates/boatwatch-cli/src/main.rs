use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use boatwatch_adapters::TypeLookupTable;
use boatwatch_storage::BoatSnapshotSource;
use boatwatch_sync::{connect_store, SyncConfig};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "boatwatch")]
#[command(about = "Atoll vessel tracker: refresh, serve and inspect boat positions")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one gated refresh cycle and print its report
    Sync,
    /// Apply database migrations
    Migrate,
    /// Serve the HTTP API (and the cron refresh when enabled)
    Serve,
    /// Set the stored type of every boat listed in a type CSV
    ApplyTypes {
        /// Defaults to BOATWATCH_TYPES_CSV
        #[arg(long)]
        csv: Option<PathBuf>,
    },
    /// Print the persisted boats as JSON
    Boats,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let report = boatwatch_sync::run_sync_once_from_env().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env();
            let store = connect_store(&config).await?;
            store.migrate().await.context("running migrations")?;
            info!("migrations applied");
        }
        Commands::Serve => {
            boatwatch_web::serve_from_env().await?;
        }
        Commands::ApplyTypes { csv } => {
            let config = SyncConfig::from_env();
            let Some(path) = csv.or_else(|| config.types_csv.clone()) else {
                bail!("no type CSV given; pass --csv or set BOATWATCH_TYPES_CSV");
            };
            let table = TypeLookupTable::load_if_present(&path)?;
            if table.is_empty() {
                println!("no type labels in {}", path.display());
                return Ok(());
            }
            let store = connect_store(&config).await?;
            let updated = store
                .apply_type_labels(&table.to_pairs())
                .await
                .context("applying type labels")?;
            println!("updated {updated} of {} listed boats", table.len());
        }
        Commands::Boats => {
            let config = SyncConfig::from_env();
            let store = connect_store(&config).await?;
            let rows = store.list_boats().await.context("listing boats")?;
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
    }

    Ok(())
}
