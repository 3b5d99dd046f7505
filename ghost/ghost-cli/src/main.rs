//! ghostctl - operate on a Ghost storage tree.
//!
//! # Usage
//!
//! ```bash
//! # Push the disk trees into the database
//! ghostctl sync
//!
//! # Compare an unpacked tree against the database
//! ghostctl changes --tmp ./incoming
//!
//! # Make the database match an unpacked tree
//! ghostctl force-update --tmp ./incoming
//!
//! # Archive every bot and the global scope
//! ghostctl export --out backup.tgz
//! ```

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::ConfigOverrides;
use std::path::PathBuf;
use std::process;

#[derive(Parser)]
#[command(name = "ghostctl")]
#[command(about = "Ghost - virtual filesystem over disk and database", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log level when RUST_LOG is unset (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "GHOST_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Configuration file path
    #[arg(short, long, global = true, env = "GHOST_CONFIG")]
    config: Option<PathBuf>,

    /// Directory containing `data/`
    #[arg(long, global = true)]
    data_root: Option<PathBuf>,

    /// SQLite connection URL
    #[arg(long, global = true)]
    database_url: Option<String>,

    /// Use the disk as primary storage
    #[arg(long, global = true)]
    disk_only: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Reconcile disk files into the database
    Sync {
        /// Only sync this bot
        #[arg(short, long)]
        bot: Option<String>,
    },

    /// List changes between a local tree and the database
    Changes {
        /// Tree laid out as data/global and data/bots/<id>
        #[arg(long)]
        tmp: PathBuf,
    },

    /// Overwrite the database with a local tree
    ForceUpdate {
        /// Tree laid out as data/global and data/bots/<id>
        #[arg(long)]
        tmp: PathBuf,
    },

    /// Write a gzipped tarball of every bot and the global scope
    Export {
        /// Output file
        #[arg(short, long)]
        out: PathBuf,
    },

    /// Unpack an archive produced by `export`
    Extract {
        /// Archive file
        #[arg(short, long)]
        archive: PathBuf,

        /// Destination directory
        #[arg(short, long)]
        out: PathBuf,
    },

    /// Show revisions not yet synced to disk
    Pending {
        /// Bots to include (default: every bot)
        #[arg(short, long)]
        bot: Vec<String>,
    },

    /// Watch the disk trees and serve sync requests until interrupted
    Watch,

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("error: {:#}", e);
        process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbose, &cli.log_level);

    let command = match cli.command {
        // Archive extraction needs no storage.
        Commands::Extract { archive, out } => return commands::extract(archive, out).await,
        command => command,
    };

    let overrides = ConfigOverrides {
        data_root: cli.data_root,
        database_url: cli.database_url,
        disk_only: cli.disk_only,
    };
    let config = commands::load_config(cli.config.as_deref(), &overrides).await?;

    match command {
        Commands::Sync { bot } => commands::sync(config, bot).await,
        Commands::Changes { tmp } => commands::changes(config, tmp).await,
        Commands::ForceUpdate { tmp } => commands::force_update(config, tmp).await,
        Commands::Export { out } => commands::export(config, out).await,
        Commands::Pending { bot } => commands::pending(config, bot).await,
        Commands::Watch => commands::watch(config).await,
        Commands::Config => commands::show_config(&config),
        Commands::Extract { .. } => Ok(()),
    }
}

fn init_logging(verbose: bool, level: &str) {
    use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

    let filter = if verbose {
        EnvFilter::new("ghost_vfs=debug,ghost_core=debug,ghostctl=debug,info")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| {
                EnvFilter::new(format!(
                    "ghost_vfs={level},ghost_core={level},ghostctl={level},warn"
                ))
            })
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false).with_writer(std::io::stderr))
        .init();
}
