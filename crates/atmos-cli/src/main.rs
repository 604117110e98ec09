use std::path::PathBuf;

use anyhow::Result;
use atmos_storage::Store;
use atmos_sync::{default_locations, load_locations_file, Pipeline, RunConfig};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "atmos-cli")]
#[command(about = "Checkpointed air-quality and weather ingestion")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Ingest one batch of locations and recompute aggregates
    Run {
        /// Locations processed per run
        #[arg(long, default_value_t = 25)]
        batch_size: usize,

        /// Pollutant grouping the average-temperature aggregate
        #[arg(long, default_value = "pm25")]
        designated_pollutant: String,

        /// SQLite database path
        #[arg(long, default_value = "atmos.db")]
        database: PathBuf,

        /// Newline-separated ordered location list; built-in list if omitted
        #[arg(long)]
        locations_file: Option<PathBuf>,

        /// Concurrent provider fetches
        #[arg(long, default_value_t = 4)]
        fetch_concurrency: usize,

        /// Stop ingesting once the air-quality table holds this many rows
        #[arg(long)]
        max_rows: Option<i64>,
    },
    /// Print the checkpoint and row counts
    Show {
        #[arg(long, default_value = "atmos.db")]
        database: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run {
        batch_size: 25,
        designated_pollutant: "pm25".to_string(),
        database: PathBuf::from("atmos.db"),
        locations_file: None,
        fetch_concurrency: 4,
        max_rows: None,
    }) {
        Commands::Run {
            batch_size,
            designated_pollutant,
            database,
            locations_file,
            fetch_concurrency,
            max_rows,
        } => {
            let locations = match locations_file {
                Some(path) => load_locations_file(path).await?,
                None => default_locations(),
            };
            let config = RunConfig {
                database_path: database,
                batch_size,
                designated_pollutant,
                fetch_concurrency,
                max_rows,
                ..RunConfig::default()
            };
            let pipeline = Pipeline::with_live_adapters(config, locations).await?;
            let summary = pipeline.run_once().await?;
            info!(
                run_id = %summary.run_id,
                processed = summary.locations_processed,
                inserted = summary.batch.inserted(),
                duplicate = summary.batch.duplicates(),
                fetch_failures = summary.fetch_failures,
                checkpoint = summary.offset_after,
                aggregate_rows = summary.aggregate_rows,
                "run complete"
            );
        }
        Commands::Show { database } => {
            let store = Store::open(&database).await?;
            store.bootstrap().await?;
            let counts = store.counts().await?;
            println!("checkpoint:          {}", counts.checkpoint);
            println!("locations:           {}", counts.locations);
            println!("air quality rows:    {}", counts.air_quality);
            println!("weather rows:        {}", counts.weather);
            println!("aggregate rows:      {}", counts.aggregates);
        }
    }

    Ok(())
}
