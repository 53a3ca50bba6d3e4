use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use rlp_sync::config::{PipelineConfig, DEFAULT_CONFIG_PATH};
use rlp_sync::{Command, Pipeline};
use tracing::debug;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "rlp")]
#[command(about = "Rental livability pipeline: scrape, geocode, score and publish")]
struct Cli {
    /// Pipeline configuration file; a missing file means defaults.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Scrape listing pages for every configured area, resuming where the last run stopped.
    Scrape {
        /// Re-scrape areas already marked completed.
        #[arg(long)]
        force: bool,
    },
    /// Resolve coordinates for scraped addresses not yet in the cache.
    Geocode,
    /// Merge, score and publish the master dataset.
    Score,
    /// Scrape, geocode and score in one run.
    All {
        #[arg(long)]
        force: bool,
    },
}

impl From<Commands> for Command {
    fn from(value: Commands) -> Self {
        match value {
            Commands::Scrape { force } => Command::Scrape { force },
            Commands::Geocode => Command::Geocode,
            Commands::Score => Command::Score,
            Commands::All { force } => Command::All { force },
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rlp=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = PipelineConfig::load(&cli.config)?;
    debug!(config = ?cli.config, data_dir = ?config.data_dir, "configuration loaded");

    let pipeline = Pipeline::new(config)?;
    let report = pipeline.execute(cli.command.into()).await?;
    println!("{}", report.one_line());
    println!("reports: {}", report.reports_dir);

    Ok(())
}
