//! Command-line interface: argument definitions and logging setup.

pub(crate) mod cache;
pub(crate) mod config;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use callguard::config::Config;

/// Inspect and maintain callguard configuration and cache snapshots.
#[derive(Parser, Debug)]
#[command(name = "callguard")]
#[command(version)]
#[command(about = "Rate limiting, response caching and connection pooling for API calls")]
pub(crate) struct Cli {
    /// Config file to use instead of ~/.callguard/config.json
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Command {
    /// Show or validate configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Inspect or maintain the persisted response cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand, Debug)]
pub(crate) enum ConfigAction {
    /// Print the effective configuration (file + environment overrides)
    Show,
    /// Validate the configuration and report problems
    Check,
}

#[derive(Subcommand, Debug)]
pub(crate) enum CacheAction {
    /// Print statistics for the cache snapshot
    Stats,
    /// Drop expired entries from the snapshot
    Prune,
    /// Remove every entry from the snapshot
    Clear,
}

/// Install the global tracing subscriber. `RUST_LOG` wins over the default
/// `info` level.
pub(crate) fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Load the config from `path`, or from the default location when `None`.
pub(crate) fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => {
            let mut config = Config::load_from_path(path)
                .with_context(|| format!("Failed to read config {}", path.display()))?;
            dotenvy::dotenv().ok();
            config.apply_env_overrides(|name| std::env::var(name).ok())?;
            Ok(config)
        }
        None => Config::load().context("Failed to load config"),
    }
}

pub(crate) fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Config { action } => config::cmd_config(cli.config.as_deref(), action),
        Command::Cache { action } => cache::cmd_cache(cli.config.as_deref(), action),
    }
}
