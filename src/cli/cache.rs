//! `callguard cache` command handler. Works on the snapshot file directly so
//! it can be run while no service is holding the cache.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::Value;

use callguard::cache::persist::{self, CacheSnapshot};
use callguard::clock::{self, Clock, SharedClock};
use callguard::config::{CacheConfig, Config};

use super::{load_config, CacheAction};

/// Handle `callguard cache` subcommands.
pub(crate) fn cmd_cache(config_path: Option<&Path>, action: CacheAction) -> Result<()> {
    let config = load_config(config_path)?;
    let path = snapshot_path(&config.cache);
    run_action(&path, action, &clock::system())
}

fn snapshot_path(config: &CacheConfig) -> PathBuf {
    config
        .persist_path
        .clone()
        .unwrap_or_else(Config::default_cache_path)
}

fn load(path: &Path) -> Result<Option<CacheSnapshot<Value>>> {
    persist::read_snapshot(path)
        .with_context(|| format!("Failed to load cache snapshot {}", path.display()))
}

fn run_action(path: &Path, action: CacheAction, clock: &SharedClock) -> Result<()> {
    let now = clock.now_millis();
    match action {
        CacheAction::Stats => {
            let Some(snapshot) = load(path)? else {
                println!("No cache snapshot at {}", path.display());
                return Ok(());
            };
            let total = snapshot.entries.len();
            let expired = snapshot
                .entries
                .values()
                .filter(|e| e.is_expired(now))
                .count();
            let hits: u64 = snapshot.entries.values().map(|e| u64::from(e.hit_count)).sum();
            let size = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);

            println!("Snapshot:  {}", path.display());
            println!("Size:      {} bytes", size);
            println!("Entries:   {}", total);
            println!("Live:      {}", total - expired);
            println!("Expired:   {}", expired);
            println!("Hits:      {}", hits);
        }
        CacheAction::Prune => {
            let Some(mut snapshot) = load(path)? else {
                println!("No cache snapshot at {}", path.display());
                return Ok(());
            };
            let before = snapshot.entries.len();
            snapshot.entries.retain(|_, e| !e.is_expired(now));
            let removed = before - snapshot.entries.len();
            if removed > 0 {
                persist::write_snapshot(path, &snapshot)
                    .context("Failed to rewrite cache snapshot")?;
            }
            println!(
                "Pruned {} expired entries ({} remaining).",
                removed,
                snapshot.entries.len()
            );
        }
        CacheAction::Clear => {
            let previous = load(path)?.map(|s| s.entries.len()).unwrap_or(0);
            let empty: CacheSnapshot<Value> = CacheSnapshot::new(Default::default());
            persist::write_snapshot(path, &empty).context("Failed to write cache snapshot")?;
            println!("Cleared {} entries from {}", previous, path.display());
        }
    }
    Ok(())
}
