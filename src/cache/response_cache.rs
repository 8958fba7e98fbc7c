//! Response cache with TTL expiry, LRU eviction, and JSON persistence.
//!
//! Keys are content fingerprints (see [`ResponseCache::cache_key`]). Entries
//! expire a fixed TTL after insertion; reads refresh LRU recency but never
//! extend the TTL. When the cache is full, expired entries are purged first
//! and only then is the least-recently-used live entry evicted.
//!
//! Persistence is best-effort: [`ResponseCache::open`] loads a snapshot if one
//! exists, and [`ResponseCache::spawn_flusher`] writes it back periodically.
//! Failures are logged and never reach `get`/`set` callers.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::persist::{self, CacheSnapshot};
use crate::clock::{self, SharedClock};
use crate::config::CacheConfig;
use crate::error::Result;

/// A single cached value with its bookkeeping. Timestamps are epoch millis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry<V> {
    /// The cached payload.
    pub value: V,
    /// When the entry was stored.
    pub inserted_at: u64,
    /// Lifetime from `inserted_at`, in milliseconds.
    pub ttl_ms: u64,
    /// Last time the entry was read or written.
    pub last_accessed_at: u64,
    /// Number of cache hits for this entry.
    #[serde(default)]
    pub hit_count: u32,
    /// Monotonic recency stamp; larger is more recent.
    #[serde(default)]
    pub access_seq: u64,
}

impl<V> CacheEntry<V> {
    /// `true` once `now` is past `inserted_at + ttl`.
    pub fn is_expired(&self, now: u64) -> bool {
        now > self.inserted_at.saturating_add(self.ttl_ms)
    }
}

struct CacheState<V> {
    entries: HashMap<String, CacheEntry<V>>,
    next_seq: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
    dirty: bool,
}

impl<V> CacheState<V> {
    /// Recency stamps are renumbered `1..=n` in their existing order, so a
    /// snapshot carrying huge or duplicated stamps cannot overflow the counter.
    fn with_entries(mut entries: HashMap<String, CacheEntry<V>>) -> Self {
        let mut order: Vec<(u64, String)> = entries
            .iter()
            .map(|(k, e)| (e.access_seq, k.clone()))
            .collect();
        order.sort_unstable();
        for (seq, (_, key)) in (1u64..).zip(order) {
            if let Some(entry) = entries.get_mut(&key) {
                entry.access_seq = seq;
            }
        }
        let next_seq = entries.len() as u64 + 1;
        Self {
            entries,
            next_seq,
            hits: 0,
            misses: 0,
            evictions: 0,
            dirty: false,
        }
    }

    fn bump_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn purge_expired(&mut self, now: u64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| !e.is_expired(now));
        let removed = before - self.entries.len();
        if removed > 0 {
            self.dirty = true;
        }
        removed
    }

    fn evict_lru(&mut self) {
        if let Some(lru_key) = self
            .entries
            .iter()
            .min_by_key(|(_, e)| e.access_seq)
            .map(|(k, _)| k.clone())
        {
            debug!(key = %short(&lru_key), "Evicting LRU cache entry");
            self.entries.remove(&lru_key);
            self.evictions += 1;
            self.dirty = true;
        }
    }
}

/// Response cache with TTL expiry, LRU eviction, and optional persistence.
///
/// Shared across request handlers via `Arc`; each call takes one short lock.
pub struct ResponseCache<V = serde_json::Value> {
    state: Mutex<CacheState<V>>,
    /// Held from snapshot to rename so writes land on disk in snapshot order.
    persist_lock: Mutex<()>,
    max_entries: usize,
    default_ttl: Duration,
    persist_path: Option<PathBuf>,
    clock: SharedClock,
}

impl<V> ResponseCache<V>
where
    V: Clone + Serialize + DeserializeOwned,
{
    /// Build an empty cache without loading anything from disk.
    ///
    /// `max_entries` is clamped to a minimum of 1 so eviction always terminates.
    pub fn new(config: &CacheConfig) -> Self {
        Self::with_clock(config, clock::system())
    }

    pub fn with_clock(config: &CacheConfig, clock: SharedClock) -> Self {
        Self {
            state: Mutex::new(CacheState::with_entries(HashMap::new())),
            persist_lock: Mutex::new(()),
            max_entries: config.max_entries.max(1),
            default_ttl: Duration::from_secs(config.ttl_secs),
            persist_path: config.persist_path.clone(),
            clock,
        }
    }

    /// Build a cache and load the snapshot at `config.persist_path`, if any.
    ///
    /// Entries whose TTL elapsed while the process was down are skipped. A
    /// missing, unreadable or corrupt snapshot yields an empty cache.
    pub fn open(config: &CacheConfig) -> Self {
        Self::open_with_clock(config, clock::system())
    }

    pub fn open_with_clock(config: &CacheConfig, clock: SharedClock) -> Self {
        let cache = Self::with_clock(config, clock);
        let Some(path) = cache.persist_path.clone() else {
            return cache;
        };

        match persist::read_snapshot::<V>(&path) {
            Ok(Some(snapshot)) => {
                let now = cache.clock.now_millis();
                let total = snapshot.entries.len();
                let mut state = CacheState::with_entries(
                    snapshot
                        .entries
                        .into_iter()
                        .filter(|(_, e)| !e.is_expired(now))
                        .collect(),
                );
                while state.entries.len() > cache.max_entries {
                    state.evict_lru();
                }
                state.dirty = false;
                info!(
                    path = %path.display(),
                    loaded = state.entries.len(),
                    skipped = total - state.entries.len(),
                    "Response cache loaded from disk"
                );
                *cache.state.lock().expect("cache lock poisoned") = state;
            }
            Ok(None) => {}
            Err(e) => warn!("Response cache snapshot unusable, starting empty: {}", e),
        }
        cache
    }

    /// Build a deterministic cache key: SHA-256 over the given parts.
    ///
    /// Each part is length-prefixed so `["ab", "c"]` and `["a", "bc"]` differ.
    pub fn cache_key(parts: &[&[u8]]) -> String {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update((part.len() as u64).to_le_bytes());
            hasher.update(part);
        }
        format!("{:x}", hasher.finalize())
    }

    /// Look up a value. Returns `None` if the key is absent or expired.
    ///
    /// On hit, refreshes the entry's LRU position and bumps its hit count.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = self.clock.now_millis();
        let mut state = self.state.lock().expect("cache lock poisoned");
        let expired = state.entries.get(key).map(|e| e.is_expired(now));
        match expired {
            Some(true) => {
                debug!(key = %short(key), "Cache entry expired, removing");
                state.entries.remove(key);
                state.misses += 1;
                state.dirty = true;
                None
            }
            Some(false) => {
                let seq = state.bump_seq();
                state.hits += 1;
                state.dirty = true;
                let entry = state.entries.get_mut(key)?;
                entry.last_accessed_at = now;
                entry.access_seq = seq;
                entry.hit_count = entry.hit_count.saturating_add(1);
                Some(entry.value.clone())
            }
            None => {
                state.misses += 1;
                None
            }
        }
    }

    /// `true` if `key` holds a live entry.
    ///
    /// A live entry counts as used: its LRU position is refreshed like a
    /// `get`, without touching hit/miss statistics or its TTL.
    pub fn has(&self, key: &str) -> bool {
        let now = self.clock.now_millis();
        let mut state = self.state.lock().expect("cache lock poisoned");
        let live = state
            .entries
            .get(key)
            .map(|e| !e.is_expired(now))
            .unwrap_or(false);
        if live {
            let seq = state.bump_seq();
            state.dirty = true;
            if let Some(entry) = state.entries.get_mut(key) {
                entry.last_accessed_at = now;
                entry.access_seq = seq;
            }
        }
        live
    }

    /// Store a value. `ttl` of `None` uses the cache-wide default.
    ///
    /// Overwriting an existing key never evicts. Inserting a new key into a
    /// full cache purges expired entries first, then evicts LRU entries.
    pub fn set(&self, key: impl Into<String>, value: V, ttl: Option<Duration>) {
        let key = key.into();
        let now = self.clock.now_millis();
        let ttl_ms = ttl.unwrap_or(self.default_ttl).as_millis() as u64;

        let mut state = self.state.lock().expect("cache lock poisoned");
        if !state.entries.contains_key(&key) && state.entries.len() >= self.max_entries {
            state.purge_expired(now);
            while state.entries.len() >= self.max_entries {
                state.evict_lru();
            }
        }

        let seq = state.bump_seq();
        state.entries.insert(
            key,
            CacheEntry {
                value,
                inserted_at: now,
                ttl_ms,
                last_accessed_at: now,
                hit_count: 0,
                access_seq: seq,
            },
        );
        state.dirty = true;
    }

    /// Remove `key`. Returns `true` if it was present.
    pub fn delete(&self, key: &str) -> bool {
        let mut state = self.state.lock().expect("cache lock poisoned");
        let removed = state.entries.remove(key).is_some();
        if removed {
            state.dirty = true;
        }
        removed
    }

    /// Remove all entries. Statistics are kept.
    pub fn clear(&self) {
        let mut state = self.state.lock().expect("cache lock poisoned");
        state.entries.clear();
        state.dirty = true;
    }

    /// Drop every expired entry now. Returns the number removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_millis();
        self.state
            .lock()
            .expect("cache lock poisoned")
            .purge_expired(now)
    }

    /// Number of entries held, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.state.lock().expect("cache lock poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    pub fn persist_path(&self) -> Option<&Path> {
        self.persist_path.as_deref()
    }

    /// Return aggregate statistics about the cache.
    pub fn stats(&self) -> CacheStats {
        let now = self.clock.now_millis();
        let state = self.state.lock().expect("cache lock poisoned");
        CacheStats {
            total_entries: state.entries.len(),
            expired_entries: state.entries.values().filter(|e| e.is_expired(now)).count(),
            max_entries: self.max_entries,
            hits: state.hits,
            misses: state.misses,
            evictions: state.evictions,
        }
    }

    /// Return the cached value for `key`, or compute, store and return it.
    ///
    /// Errors from `compute` are returned as-is and nothing is cached.
    /// Concurrent misses on the same key may each run `compute`.
    pub async fn get_or_insert_with<F, Fut, E>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        compute: F,
    ) -> std::result::Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<V, E>>,
    {
        if let Some(hit) = self.get(key) {
            return Ok(hit);
        }
        let value = compute().await?;
        self.set(key, value.clone(), ttl);
        Ok(value)
    }

    /// Write the current entries to `persist_path`.
    ///
    /// The entry map is cloned under the state lock and serialized after it
    /// is released, so readers and writers are never held up by disk I/O.
    /// Concurrent calls are serialized: a snapshot taken later is always
    /// written later, and a change made mid-write leaves the cache dirty.
    /// A no-op when persistence is disabled or nothing changed since the
    /// last successful write.
    pub fn persist(&self) -> Result<()> {
        let Some(path) = self.persist_path.as_deref() else {
            return Ok(());
        };

        let _writing = self.persist_lock.lock().expect("cache persist lock poisoned");
        let snapshot = {
            let mut state = self.state.lock().expect("cache lock poisoned");
            if !state.dirty {
                return Ok(());
            }
            state.dirty = false;
            CacheSnapshot::new(state.entries.clone())
        };

        let count = snapshot.entries.len();
        if let Err(e) = persist::write_snapshot(path, &snapshot) {
            self.state.lock().expect("cache lock poisoned").dirty = true;
            return Err(e);
        }
        debug!(path = %path.display(), entries = count, "Response cache persisted");
        Ok(())
    }

    fn snapshot_entries(&self) -> HashMap<String, CacheEntry<V>> {
        self.state
            .lock()
            .expect("cache lock poisoned")
            .entries
            .clone()
    }

    /// Keys currently held, most recently used first.
    pub fn keys_by_recency(&self) -> Vec<String> {
        let mut entries: Vec<_> = self.snapshot_entries().into_iter().collect();
        entries.sort_by(|a, b| b.1.access_seq.cmp(&a.1.access_seq));
        entries.into_iter().map(|(k, _)| k).collect()
    }
}

impl<V> ResponseCache<V>
where
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Persist every `interval` until `shutdown_rx` turns `true`, then flush
    /// one last time. Write errors are logged and the loop carries on.
    pub fn spawn_flusher(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let stop = tokio::select! {
                    changed = shutdown_rx.changed() => {
                        changed.is_err() || *shutdown_rx.borrow()
                    }
                    _ = tokio::time::sleep(interval) => *shutdown_rx.borrow(),
                };

                let cache = Arc::clone(&self);
                match tokio::task::spawn_blocking(move || cache.persist()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!("Failed to save response cache: {}", e),
                    Err(e) => warn!("Response cache flush task failed: {}", e),
                }

                if stop {
                    info!("Response cache flusher shutting down");
                    return;
                }
            }
        })
    }
}

impl<V> std::fmt::Debug for ResponseCache<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseCache")
            .field("max_entries", &self.max_entries)
            .field("default_ttl", &self.default_ttl)
            .field("persist_path", &self.persist_path)
            .finish()
    }
}

/// Aggregate cache statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Number of entries currently held.
    pub total_entries: usize,
    /// Entries held but already past their TTL.
    pub expired_entries: usize,
    /// Configured capacity.
    pub max_entries: usize,
    /// Lookups that returned a value.
    pub hits: u64,
    /// Lookups that found nothing or an expired entry.
    pub misses: u64,
    /// Entries removed to make room.
    pub evictions: u64,
}

/// First 8 chars of a key for log output.
fn short(key: &str) -> &str {
    key.get(..8).unwrap_or(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use tempfile::TempDir;

    fn config(max_entries: usize, ttl_secs: u64) -> CacheConfig {
        CacheConfig {
            max_entries,
            ttl_secs,
            persist_path: None,
            ..Default::default()
        }
    }

    fn test_cache(max_entries: usize, ttl_secs: u64) -> (ResponseCache<i32>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let cache = ResponseCache::with_clock(&config(max_entries, ttl_secs), clock.clone());
        (cache, clock)
    }

    #[test]
    fn test_cache_key_deterministic() {
        let k1 = ResponseCache::<i32>::cache_key(&[b"whisper", b"audio-bytes"]);
        let k2 = ResponseCache::<i32>::cache_key(&[b"whisper", b"audio-bytes"]);
        assert_eq!(k1, k2);
        assert_eq!(k1.len(), 64);
    }

    #[test]
    fn test_cache_key_is_lowercase_hex_digest() {
        // No parts hashes nothing: the SHA-256 of the empty input.
        assert_eq!(
            ResponseCache::<i32>::cache_key(&[]),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_cache_key_content_aware() {
        let k1 = ResponseCache::<i32>::cache_key(&[b"audio-a"]);
        let k2 = ResponseCache::<i32>::cache_key(&[b"audio-b"]);
        assert_ne!(k1, k2);
    }

    #[test]
    fn test_cache_key_no_separator_collision() {
        let k1 = ResponseCache::<i32>::cache_key(&[b"ab", b"c"]);
        let k2 = ResponseCache::<i32>::cache_key(&[b"a", b"bc"]);
        assert_ne!(k1, k2, "length-prefixed encoding must prevent collisions");
    }

    #[test]
    fn test_cache_hit_miss() {
        let (cache, _clock) = test_cache(5, 60);
        assert!(cache.get("k").is_none());
        cache.set("k", 7, None);
        assert_eq!(cache.get("k"), Some(7));
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_cache_ttl_expiry() {
        let (cache, clock) = test_cache(5, 300);
        cache.set("k", 1, Some(Duration::from_secs(60)));
        assert_eq!(cache.get("k"), Some(1));
        clock.advance(Duration::from_secs(60));
        assert_eq!(cache.get("k"), Some(1), "still valid exactly at the TTL");
        clock.advance(Duration::from_millis(1));
        assert!(cache.get("k").is_none());
        assert!(cache.is_empty(), "expired entry removed on read");
    }

    #[test]
    fn test_default_ttl_applies() {
        let (cache, clock) = test_cache(5, 10);
        cache.set("k", 1, None);
        clock.advance(Duration::from_secs(11));
        assert!(!cache.has("k"));
    }

    #[test]
    fn test_reads_do_not_extend_ttl() {
        let (cache, clock) = test_cache(5, 10);
        cache.set("k", 1, None);
        clock.advance(Duration::from_secs(8));
        assert!(cache.get("k").is_some());
        clock.advance(Duration::from_secs(3));
        assert!(cache.get("k").is_none());
    }

    #[test]
    fn test_has_is_ttl_aware() {
        let (cache, clock) = test_cache(5, 60);
        assert!(!cache.has("k"));
        cache.set("k", 1, None);
        assert!(cache.has("k"));
        clock.advance(Duration::from_secs(61));
        assert!(!cache.has("k"));
    }

    #[test]
    fn test_lru_refresh_scenario() {
        let (cache, _clock) = test_cache(2, 60);
        cache.set("a", 1, None);
        cache.set("b", 2, None);
        assert_eq!(cache.get("a"), Some(1));
        cache.set("c", 3, None);
        assert!(!cache.has("b"), "b was least recently used");
        assert_eq!(cache.get("a"), Some(1));
        assert_eq!(cache.get("c"), Some(3));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_fill_then_insert_evicts_only_lru() {
        let (cache, _clock) = test_cache(5, 60);
        for i in 0..5 {
            cache.set(format!("k{i}"), i, None);
        }
        // Touch everything except k2.
        for i in [0, 1, 3, 4] {
            cache.get(&format!("k{i}"));
        }
        cache.set("k5", 5, None);
        assert!(!cache.has("k2"));
        for i in [0, 1, 3, 4, 5] {
            assert!(cache.has(&format!("k{i}")), "k{i} should remain");
        }
        assert_eq!(cache.len(), 5, "should stay at max capacity");
    }

    #[test]
    fn test_expired_evicted_before_lru() {
        let (cache, clock) = test_cache(3, 60);
        cache.set("old", 0, Some(Duration::from_secs(5)));
        cache.set("x", 1, None);
        cache.set("y", 2, None);
        cache.get("old"); // most recent, but about to expire
        clock.advance(Duration::from_secs(6));
        cache.set("z", 3, None);
        assert!(cache.has("x"), "live LRU entry kept while an expired one exists");
        assert!(cache.has("y"));
        assert!(cache.has("z"));
        assert_eq!(cache.stats().evictions, 0);
    }

    #[test]
    fn test_overwrite_does_not_evict() {
        let (cache, _clock) = test_cache(2, 60);
        cache.set("a", 1, None);
        cache.set("b", 2, None);
        cache.set("a", 10, None);
        assert_eq!(cache.get("a"), Some(10));
        assert_eq!(cache.get("b"), Some(2));
    }

    #[test]
    fn test_delete_and_clear() {
        let (cache, _clock) = test_cache(5, 60);
        cache.set("a", 1, None);
        cache.set("b", 2, None);
        assert!(cache.delete("a"));
        assert!(!cache.delete("a"));
        assert!(!cache.has("a"));
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_purge_expired_counts() {
        let (cache, clock) = test_cache(5, 60);
        cache.set("short", 1, Some(Duration::from_secs(1)));
        cache.set("long", 2, None);
        clock.advance(Duration::from_secs(2));
        assert_eq!(cache.stats().expired_entries, 1);
        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_max_entries_zero_clamped() {
        let (cache, _clock) = test_cache(0, 60);
        assert_eq!(cache.max_entries(), 1);
        cache.set("a", 1, None);
        cache.set("b", 2, None);
        assert_eq!(cache.len(), 1);
        assert!(cache.has("b"));
    }

    #[test]
    fn test_keys_by_recency() {
        let (cache, _clock) = test_cache(5, 60);
        cache.set("a", 1, None);
        cache.set("b", 2, None);
        cache.get("a");
        assert_eq!(cache.keys_by_recency(), vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn test_get_or_insert_with_memoizes() {
        let (cache, _clock) = test_cache(5, 60);
        let calls = std::sync::atomic::AtomicU32::new(0);
        for _ in 0..3 {
            let v: std::result::Result<i32, String> = cache
                .get_or_insert_with("fp", None, || async {
                    calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    Ok(42)
                })
                .await;
            assert_eq!(v.unwrap(), 42);
        }
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_get_or_insert_with_does_not_cache_errors() {
        let (cache, _clock) = test_cache(5, 60);
        let err: std::result::Result<i32, String> = cache
            .get_or_insert_with("fp", None, || async { Err("upstream down".to_string()) })
            .await;
        assert!(err.is_err());
        assert!(!cache.has("fp"));
    }

    // --- persistence ---

    fn persistent_config(tmp: &TempDir, ttl_secs: u64) -> CacheConfig {
        CacheConfig {
            max_entries: 10,
            ttl_secs,
            persist_path: Some(tmp.path().join("cache").join("responses.json")),
            ..Default::default()
        }
    }

    #[test]
    fn test_persist_round_trip_across_restart() {
        let tmp = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let cfg = persistent_config(&tmp, 60);

        let cache: ResponseCache<String> = ResponseCache::open_with_clock(&cfg, clock.clone());
        cache.set("fp", "transcript".to_string(), None);
        cache.persist().unwrap();

        clock.advance(Duration::from_secs(30));
        let reopened: ResponseCache<String> = ResponseCache::open_with_clock(&cfg, clock.clone());
        assert_eq!(reopened.get("fp"), Some("transcript".to_string()));
    }

    #[test]
    fn test_load_skips_entries_expired_while_down() {
        let tmp = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let cfg = persistent_config(&tmp, 60);

        let cache: ResponseCache<i32> = ResponseCache::open_with_clock(&cfg, clock.clone());
        cache.set("short", 1, Some(Duration::from_secs(10)));
        cache.set("long", 2, Some(Duration::from_secs(600)));
        cache.persist().unwrap();

        clock.advance(Duration::from_secs(120));
        let reopened: ResponseCache<i32> = ResponseCache::open_with_clock(&cfg, clock.clone());
        assert_eq!(reopened.len(), 1);
        assert_eq!(reopened.get("long"), Some(2));
    }

    #[test]
    fn test_load_preserves_lru_order() {
        let tmp = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let mut cfg = persistent_config(&tmp, 600);
        cfg.max_entries = 2;

        let cache: ResponseCache<i32> = ResponseCache::open_with_clock(&cfg, clock.clone());
        cache.set("a", 1, None);
        cache.set("b", 2, None);
        cache.get("a");
        cache.persist().unwrap();

        let reopened: ResponseCache<i32> = ResponseCache::open_with_clock(&cfg, clock.clone());
        reopened.set("c", 3, None);
        assert!(reopened.has("a"));
        assert!(!reopened.has("b"));
    }

    #[test]
    fn test_corrupt_snapshot_starts_empty() {
        let tmp = TempDir::new().unwrap();
        let cfg = persistent_config(&tmp, 60);
        let path = cfg.persist_path.clone().unwrap();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "{not json").unwrap();

        let cache: ResponseCache<i32> = ResponseCache::open(&cfg);
        assert!(cache.is_empty());
        cache.set("k", 1, None);
        assert_eq!(cache.get("k"), Some(1));
    }

    #[test]
    fn test_persist_failure_is_reported_and_cache_keeps_working() {
        let tmp = TempDir::new().unwrap();
        // A regular file where the parent directory should be.
        let blocker = tmp.path().join("blocker");
        std::fs::write(&blocker, "x").unwrap();
        let cfg = CacheConfig {
            persist_path: Some(blocker.join("responses.json")),
            ..config(5, 60)
        };
        let cache: ResponseCache<i32> = ResponseCache::open(&cfg);
        cache.set("k", 1, None);
        assert!(cache.persist().is_err());
        assert_eq!(cache.get("k"), Some(1));
    }

    #[test]
    fn test_concurrent_persist_never_leaves_stale_snapshot() {
        let tmp = TempDir::new().unwrap();
        let cfg = persistent_config(&tmp, 600);
        let cache: Arc<ResponseCache<i32>> = Arc::new(ResponseCache::open(&cfg));

        for round in 0..50 {
            std::thread::scope(|s| {
                for t in 0..2 {
                    let cache = &cache;
                    s.spawn(move || {
                        cache.set(format!("r{round}-t{t}"), round, None);
                        cache.persist().expect("overlapping persist must not fail");
                    });
                }
            });
            cache.persist().unwrap();

            let reopened: ResponseCache<i32> = ResponseCache::open(&cfg);
            let mut on_disk = reopened.keys_by_recency();
            let mut in_memory = cache.keys_by_recency();
            on_disk.sort();
            in_memory.sort();
            assert_eq!(on_disk, in_memory, "round {round}: disk behind memory");
        }
    }

    #[test]
    fn test_has_refreshes_lru_position() {
        let (cache, _clock) = test_cache(2, 60);
        cache.set("a", 1, None);
        cache.set("b", 2, None);
        assert!(cache.has("a"));
        cache.set("c", 3, None);
        assert!(cache.has("a"), "has counts as a use");
        assert!(!cache.has("b"));
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses), (0, 0), "has does not count as a lookup");
    }

    #[test]
    fn test_has_does_not_extend_ttl() {
        let (cache, clock) = test_cache(5, 10);
        cache.set("k", 1, None);
        clock.advance(Duration::from_secs(8));
        assert!(cache.has("k"));
        clock.advance(Duration::from_secs(3));
        assert!(!cache.has("k"));
    }

    #[test]
    fn test_load_renumbers_saturated_recency_stamps() {
        let tmp = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let mut cfg = persistent_config(&tmp, 600);
        cfg.max_entries = 2;
        let path = cfg.persist_path.clone().unwrap();

        let stamp = |seq: u64| CacheEntry {
            value: 0,
            inserted_at: 1_700_000_000_000,
            ttl_ms: 600_000,
            last_accessed_at: 1_700_000_000_000,
            hit_count: 0,
            access_seq: seq,
        };
        let mut entries = HashMap::new();
        entries.insert("old".to_string(), stamp(u64::MAX - 1));
        entries.insert("new".to_string(), stamp(u64::MAX));
        persist::write_snapshot(&path, &CacheSnapshot::new(entries)).unwrap();

        let cache: ResponseCache<i32> = ResponseCache::open_with_clock(&cfg, clock);
        assert_eq!(cache.keys_by_recency(), vec!["new".to_string(), "old".to_string()]);
        cache.set("fresh", 1, None);
        assert!(!cache.has("old"), "relative order survives renumbering");
        assert!(cache.has("new"));
        assert!(cache.has("fresh"));
    }

    #[test]
    fn test_persist_without_path_is_noop() {
        let (cache, _clock) = test_cache(5, 60);
        cache.set("k", 1, None);
        assert!(cache.persist().is_ok());
    }

    #[tokio::test]
    async fn test_flusher_writes_on_shutdown() {
        let tmp = TempDir::new().unwrap();
        let cfg = persistent_config(&tmp, 600);
        let path = cfg.persist_path.clone().unwrap();
        let cache: Arc<ResponseCache<i32>> = Arc::new(ResponseCache::open(&cfg));
        cache.set("k", 9, None);

        let (tx, rx) = watch::channel(false);
        let handle = cache.clone().spawn_flusher(Duration::from_secs(3600), rx);
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("flusher should stop")
            .unwrap();

        assert!(path.exists());
        let reopened: ResponseCache<i32> = ResponseCache::open(&cfg);
        assert_eq!(reopened.get("k"), Some(9));
    }

    #[tokio::test]
    async fn test_flusher_writes_periodically() {
        let tmp = TempDir::new().unwrap();
        let cfg = persistent_config(&tmp, 600);
        let path = cfg.persist_path.clone().unwrap();
        let cache: Arc<ResponseCache<i32>> = Arc::new(ResponseCache::open(&cfg));
        cache.set("k", 1, None);

        let (tx, rx) = watch::channel(false);
        let handle = cache.clone().spawn_flusher(Duration::from_millis(20), rx);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(path.exists(), "snapshot written without shutdown");

        let _ = tx.send(true);
        let _ = handle.await;
    }
}
