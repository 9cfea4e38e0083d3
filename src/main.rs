// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! mediafetch CLI - serve the command endpoint or inspect the pool.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use mediafetch::config::Config;
use mediafetch::download::DownloadManager;
use mediafetch::server::Server;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// mediafetch - remote transfer jobs to synced local storage.
#[derive(Parser)]
#[command(name = "mediafetch")]
#[command(version = VERSION)]
#[command(about = "Download orchestration engine: remote transfer jobs to synced local storage.")]
#[command(long_about = "mediafetch - Download orchestration engine\n\n\
    Start the server:    mediafetch serve\n\
    Scan storage:        mediafetch scan\n\
    Pool summary:        mediafetch status\n\n\
    Log level follows MEDIAFETCH_LOG, then RUST_LOG.")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Config file (defaults to ~/.mediafetch/config.json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose mode: debug logging for mediafetch
    #[arg(short = 'v', long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the command server (default)
    Serve {
        /// Listen address, overrides the config
        #[arg(short, long)]
        listen: Option<String>,
    },
    /// Scan synced storage and print what was found
    Scan,
    /// Print pool counters from the last snapshot
    #[command(alias = "s")]
    Status,
}

/// `MEDIAFETCH_LOG` > `RUST_LOG` > verbosity default.
fn build_env_filter(verbose: bool) -> EnvFilter {
    if let Ok(directives) = std::env::var("MEDIAFETCH_LOG") {
        if let Ok(filter) = EnvFilter::try_new(&directives) {
            return filter;
        }
    }
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    EnvFilter::new(if verbose { "mediafetch=debug" } else { "mediafetch=info" })
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(build_env_filter(cli.verbose))
        .with_target(false)
        .init();

    let config = Config::load(cli.config.as_deref())?;
    let runtime = tokio::runtime::Runtime::new().context("Failed to create Tokio runtime")?;

    runtime.block_on(async move {
        match cli.command.unwrap_or(Commands::Serve { listen: None }) {
            Commands::Serve { listen } => serve(config, listen).await,
            Commands::Scan => scan(config).await,
            Commands::Status => status(config).await,
        }
    })
}

async fn serve(config: Config, listen: Option<String>) -> Result<()> {
    let listen = listen.unwrap_or_else(|| config.listen.clone());
    let manager = DownloadManager::from_config(config)?;
    manager.read_from_disk().await?;

    let stats = manager.stats();
    tracing::info!(
        total = stats.total,
        associated = stats.associated,
        "mediafetch v{} ready",
        VERSION
    );

    Server::new(manager).with_listen(listen).start().await
}

async fn scan(config: Config) -> Result<()> {
    let root = config.synced_root.clone();
    let manager = DownloadManager::from_config(config)?;
    let count = manager.refresh_disk_downloads().await?;

    println!("Scanned {:?}: {} media files", root, count);
    for item in manager.downloads() {
        let state = if item.is_local_to_client { "local" } else { "cloud" };
        println!("  [{:5}] {:>12}  {}", state, item.size, item.cloud_id);
    }
    let collections = manager.collections();
    if !collections.is_empty() {
        println!("Collections:");
        for (name, count) in collections {
            println!("  {} ({})", name, count);
        }
    }
    Ok(())
}

async fn status(config: Config) -> Result<()> {
    let snapshot = config.snapshot_path.clone();
    let manager = DownloadManager::from_config(config)?;
    manager.read_from_disk().await?;

    let stats = manager.stats();
    println!("mediafetch v{}", VERSION);
    println!("  Snapshot:     {:?}", snapshot);
    println!("  Items:        {}", stats.total);
    println!("  Associated:   {}", stats.associated);
    println!("  Unassociated: {}", stats.unassociated);
    Ok(())
}
