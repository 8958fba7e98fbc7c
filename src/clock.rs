//! Time sources for the limiter and cache.
//!
//! Timestamps are milliseconds since the Unix epoch so cache entries can be
//! persisted and compared after a restart. Tests drive a [`ManualClock`].
//!
//! Two real clocks are provided. [`SystemClock`] follows the wall clock, so
//! it agrees with timestamps written by an earlier process but can step
//! backwards when the host clock is corrected. [`MonotonicClock`] reads the
//! wall clock once and then advances with [`Instant`], so it never goes
//! backwards but drifts from wall time over a long uptime. The cache uses the
//! former because its snapshots outlive the process; the rate limiter keeps
//! state in memory only and uses the latter, so a clock step can neither
//! stretch nor cut short a window or block.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Source of "now" in epoch milliseconds.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> u64;
}

fn wall_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Wall-clock time from [`SystemTime`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        wall_millis()
    }
}

/// Epoch milliseconds that never decrease: wall time at construction plus
/// the [`Instant`] elapsed since.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    anchor_millis: u64,
    started: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            anchor_millis: wall_millis(),
            started: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_millis(&self) -> u64 {
        self.anchor_millis
            .saturating_add(self.started.elapsed().as_millis() as u64)
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start_millis: u64) -> Self {
        Self {
            now: AtomicU64::new(start_millis),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set(&self, millis: u64) {
        self.now.store(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Shared handle to a clock.
pub type SharedClock = Arc<dyn Clock>;

/// Wall clock, for state that is persisted across restarts.
pub fn system() -> SharedClock {
    Arc::new(SystemClock)
}

/// Monotonic clock, for in-memory state such as rate-limit windows.
pub fn monotonic() -> SharedClock {
    Arc::new(MonotonicClock::new())
}
