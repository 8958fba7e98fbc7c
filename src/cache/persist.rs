//! On-disk snapshot format for [`ResponseCache`](super::ResponseCache).
//!
//! A single JSON document `{ "version": 1, "entries": { key: entry } }`,
//! written to a sibling temp file and renamed into place so a crash mid-write
//! never leaves a truncated snapshot behind.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::response_cache::CacheEntry;
use crate::error::{GuardError, Result};

/// Current snapshot format version.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Persisted cache contents.
#[derive(Debug, Serialize, Deserialize)]
#[serde(bound(deserialize = "V: DeserializeOwned", serialize = "V: Serialize"))]
pub struct CacheSnapshot<V> {
    pub version: u32,
    pub entries: HashMap<String, CacheEntry<V>>,
}

impl<V> CacheSnapshot<V> {
    pub fn new(entries: HashMap<String, CacheEntry<V>>) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            entries,
        }
    }
}

/// Read a snapshot. `Ok(None)` when the file does not exist.
pub fn read_snapshot<V: DeserializeOwned>(path: &Path) -> Result<Option<CacheSnapshot<V>>> {
    let data = match std::fs::read_to_string(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(GuardError::Persistence(format!(
                "failed to read {}: {}",
                path.display(),
                e
            )))
        }
    };

    let snapshot: CacheSnapshot<V> = serde_json::from_str(&data).map_err(|e| {
        GuardError::Persistence(format!("corrupt snapshot {}: {}", path.display(), e))
    })?;

    if snapshot.version != SNAPSHOT_VERSION {
        return Err(GuardError::Persistence(format!(
            "unsupported snapshot version {} in {}",
            snapshot.version,
            path.display()
        )));
    }
    Ok(Some(snapshot))
}

/// Write a snapshot atomically (temp file + rename), creating parent dirs.
pub fn write_snapshot<V: Serialize>(path: &Path, snapshot: &CacheSnapshot<V>) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            GuardError::Persistence(format!("failed to create {}: {}", parent.display(), e))
        })?;
    }

    let json = serde_json::to_string(snapshot)?;
    let tmp = temp_path(path);
    std::fs::write(&tmp, json).map_err(|e| {
        GuardError::Persistence(format!("failed to write {}: {}", tmp.display(), e))
    })?;
    std::fs::rename(&tmp, path).map_err(|e| {
        let _ = std::fs::remove_file(&tmp);
        GuardError::Persistence(format!("failed to replace {}: {}", path.display(), e))
    })?;
    Ok(())
}

/// Sibling temp file, unique per process and per write.
fn temp_path(path: &Path) -> PathBuf {
    static WRITES: AtomicU64 = AtomicU64::new(0);
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "snapshot".into());
    name.push(format!(
        ".{}.{}.tmp",
        std::process::id(),
        WRITES.fetch_add(1, Ordering::Relaxed)
    ));
    path.with_file_name(name)
}
