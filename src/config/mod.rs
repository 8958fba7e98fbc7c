//! Configuration for the limiter, cache and pool.
//!
//! Loaded from `~/.callguard/config.json` (or an explicit path). Every section
//! and field has a default, so a partial file, or none at all, is valid.
//! A handful of cache settings can be overridden from the environment
//! (including a `.env` file).

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{GuardError, Result};
use crate::limiter::RateLimitPolicies;

/// Default cache capacity.
pub const DEFAULT_CACHE_MAX_ENTRIES: usize = 500;
/// Default cache entry lifetime (5 minutes).
pub const DEFAULT_CACHE_TTL_SECS: u64 = 300;
/// Default interval between cache snapshot writes.
pub const DEFAULT_FLUSH_INTERVAL_SECS: u64 = 60;

/// Response cache options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of entries before LRU eviction kicks in.
    pub max_entries: usize,
    /// Default entry lifetime in seconds.
    pub ttl_secs: u64,
    /// Snapshot file. `None` keeps the cache in memory only.
    pub persist_path: Option<PathBuf>,
    /// Seconds between background snapshot writes.
    pub flush_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_CACHE_MAX_ENTRIES,
            ttl_secs: DEFAULT_CACHE_TTL_SECS,
            persist_path: None,
            flush_interval_secs: DEFAULT_FLUSH_INTERVAL_SECS,
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_entries == 0 {
            return Err(GuardError::InvalidConfig(
                "cache.max_entries must be at least 1".into(),
            ));
        }
        if self.ttl_secs == 0 {
            return Err(GuardError::InvalidConfig(
                "cache.ttl_secs must be at least 1".into(),
            ));
        }
        if self.flush_interval_secs == 0 {
            return Err(GuardError::InvalidConfig(
                "cache.flush_interval_secs must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }
}

/// Connection pool options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Connections opened up front and kept idle.
    pub min: usize,
    /// Hard ceiling on open connections.
    pub max: usize,
    /// How long `acquire` waits for a free slot, in milliseconds.
    pub acquire_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min: 2,
            max: 10,
            acquire_timeout_ms: 5000,
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max == 0 {
            return Err(GuardError::InvalidConfig("pool.max must be at least 1".into()));
        }
        if self.min > self.max {
            return Err(GuardError::InvalidConfig(format!(
                "pool.min ({}) exceeds pool.max ({})",
                self.min, self.max
            )));
        }
        Ok(())
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub rate_limits: RateLimitPolicies,
    pub cache: CacheConfig,
    pub pool: PoolConfig,
}

impl Config {
    /// Base directory: `~/.callguard`.
    pub fn dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".callguard")
    }

    /// Canonical config path: `~/.callguard/config.json`.
    pub fn path() -> PathBuf {
        Self::dir().join("config.json")
    }

    /// Snapshot path used when none is configured: `~/.callguard/cache/responses.json`.
    pub fn default_cache_path() -> PathBuf {
        Self::dir().join("cache").join("responses.json")
    }

    /// Load from the canonical path, falling back to defaults when the file
    /// is absent. Environment overrides are applied and the result validated.
    pub fn load() -> Result<Self> {
        let path = Self::path();
        let mut config = if path.exists() {
            Self::load_from_path(&path)?
        } else {
            debug!(path = %path.display(), "No config file, using defaults");
            Self::default()
        };
        dotenvy::dotenv().ok();
        config.apply_env_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a JSON config file. Does not apply env overrides.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&data)?;
        Ok(config)
    }

    /// Apply `CALLGUARD_CACHE_*` overrides read through `lookup`.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup("CALLGUARD_CACHE_PATH") {
            self.cache.persist_path = Some(PathBuf::from(path));
        }
        if let Some(ttl) = lookup("CALLGUARD_CACHE_TTL_SECS") {
            self.cache.ttl_secs = ttl.trim().parse().map_err(|_| {
                GuardError::InvalidConfig(format!("CALLGUARD_CACHE_TTL_SECS: invalid value {ttl:?}"))
            })?;
        }
        if let Some(max) = lookup("CALLGUARD_CACHE_MAX_ENTRIES") {
            self.cache.max_entries = max.trim().parse().map_err(|_| {
                GuardError::InvalidConfig(format!(
                    "CALLGUARD_CACHE_MAX_ENTRIES: invalid value {max:?}"
                ))
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.rate_limits.validate()?;
        self.cache.validate()?;
        self.pool.validate()?;
        Ok(())
    }
}
