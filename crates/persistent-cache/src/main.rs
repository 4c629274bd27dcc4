//! Maintenance tool for a persistent cache directory
//!
//! Reads the same `CACHE_*` environment variables as the library.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use persistent_cache::{CacheConfig, PersistentCache, Result};
use tracing::info;
use tracing_subscriber::{prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "persistent-cache")]
#[command(about = "Inspect and maintain a persistent cache directory")]
struct Cli {
    /// Cache directory (overrides CACHE_DIR)
    #[arg(short, long)]
    dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print record counts, stored bytes and counters
    Stats {
        /// Only measure this group
        group: Option<String>,
    },

    /// Delete expired records
    Sweep {
        /// Only sweep this group
        group: Option<String>,
    },

    /// Delete records regardless of expiry
    Purge {
        /// Only purge this group
        group: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let env_filter = EnvFilter::from_default_env().add_directive("persistent_cache=info".parse()?);

    // Use JSON format for GCP Cloud Logging when LOG_FORMAT=json
    if std::env::var("LOG_FORMAT")
        .map(|v| v == "json")
        .unwrap_or(false)
    {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_stackdriver::layer())
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .init();
    };

    let cli = Cli::parse();

    let mut config = CacheConfig::from_env()?;
    if let Some(dir) = cli.dir {
        config.root = dir;
    }
    info!("Cache dir: {:?}", config.root);

    let cache = PersistentCache::open(config).await?;

    match cli.command {
        Commands::Stats { group } => {
            let mut stats = cache.stats().await?;
            if let Some(group) = group.as_deref() {
                stats.entries = cache.keys(Some(group)).await?.len();
                stats.total_size = cache.size(Some(group)).await?;
            }
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Commands::Sweep { group } => {
            let report = cache.sweep(group.as_deref()).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Purge { group } => {
            let removed = match group.as_deref() {
                Some(group) => cache.invalidate_group(group).await?,
                None => cache.invalidate_all().await?,
            };
            println!("{{\"removed\": {}}}", removed);
        }
    }

    Ok(())
}
