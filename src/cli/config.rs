//! `callguard config` command handler.

use std::path::Path;

use anyhow::{Context, Result};

use callguard::config::Config;
use callguard::limiter::PolicyName;

use super::{load_config, ConfigAction};

/// Handle `callguard config` subcommands.
pub(crate) fn cmd_config(path: Option<&Path>, action: ConfigAction) -> Result<()> {
    let config = load_config(path)?;
    match action {
        ConfigAction::Show => {
            let rendered =
                serde_json::to_string_pretty(&config).context("Failed to render config")?;
            println!("{}", rendered);
        }
        ConfigAction::Check => {
            config.validate().context("Configuration is invalid")?;
            println!("Configuration OK");
            print_summary(&config);
        }
    }
    Ok(())
}

fn print_summary(config: &Config) {
    println!();
    println!(
        "{:<10} {:>8} {:>12} {:>12}",
        "Policy", "Points", "Window (s)", "Block (s)"
    );
    println!("{}", "-".repeat(45));
    for name in PolicyName::ALL {
        let policy = config.rate_limits.get(name);
        println!(
            "{:<10} {:>8} {:>12} {:>12}",
            name, policy.points, policy.duration_secs, policy.block_duration_secs
        );
    }
    println!();
    println!(
        "Cache: {} entries max, {}s TTL, snapshot {}",
        config.cache.max_entries,
        config.cache.ttl_secs,
        config
            .cache
            .persist_path
            .as_deref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "disabled".to_string())
    );
    println!(
        "Pool:  {}..{} connections, {}ms acquire timeout",
        config.pool.min, config.pool.max, config.pool.acquire_timeout_ms
    );
}
