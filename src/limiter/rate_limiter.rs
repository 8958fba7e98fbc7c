//! In-memory fixed-window rate limiter with a block/cooldown period.
//!
//! Each key gets a [`ConsumptionRecord`]. Points accumulate within a window
//! of `duration_secs`; once the total exceeds the policy's `points` the key is
//! blocked for `block_duration_secs` (or until the window ends when that is
//! zero) and every attempt in the meantime is rejected without being counted.
//! A block that runs out starts a fresh window.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::policy::{PolicyName, RateLimitPolicies, RateLimitPolicy};
use crate::clock::{self, SharedClock};
use crate::error::{GuardError, Result};

/// Per-key mutable state. Timestamps are epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumptionRecord {
    pub key: String,
    pub points_consumed: u32,
    pub window_start: u64,
    pub blocked_until: Option<u64>,
}

impl ConsumptionRecord {
    fn new(key: &str, now: u64) -> Self {
        Self {
            key: key.to_string(),
            points_consumed: 0,
            window_start: now,
            blocked_until: None,
        }
    }

    fn restart(&mut self, now: u64) {
        self.points_consumed = 0;
        self.window_start = now;
        self.blocked_until = None;
    }
}

/// A call that was let through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    /// Points still available in the current window.
    pub remaining: u32,
    /// Points consumed so far in the current window, this call included.
    pub consumed: u32,
    /// Time until the current window resets.
    pub reset_after: Duration,
}

/// A call that was turned away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rejection {
    /// How long until the key is admitted again.
    pub retry_after: Duration,
    /// Points recorded against the key when the block started.
    pub consumed: u32,
}

impl From<Rejection> for GuardError {
    fn from(r: Rejection) -> Self {
        GuardError::RateLimited {
            retry_after: r.retry_after,
        }
    }
}

/// Outcome of [`RateLimiter::consume`].
pub type ConsumeResult = std::result::Result<Admission, Rejection>;

/// Per-key rate limiter.
///
/// All state lives behind one `Mutex`; every call is a single short critical
/// section with no I/O, so it is safe from sync and async code alike.
pub struct RateLimiter {
    policy: RateLimitPolicy,
    records: Mutex<HashMap<String, ConsumptionRecord>>,
    clock: SharedClock,
}

impl RateLimiter {
    /// Create a limiter driven by a monotonic clock.
    pub fn new(policy: RateLimitPolicy) -> Result<Self> {
        Self::with_clock(policy, clock::monotonic())
    }

    /// Create a limiter with an explicit time source.
    pub fn with_clock(policy: RateLimitPolicy, clock: SharedClock) -> Result<Self> {
        policy.validate()?;
        Ok(Self {
            policy,
            records: Mutex::new(HashMap::new()),
            clock,
        })
    }

    pub fn policy(&self) -> &RateLimitPolicy {
        &self.policy
    }

    /// Charge `points` against `key`. A `points` of zero is charged as one.
    pub fn consume(&self, key: &str, points: u32) -> ConsumeResult {
        let points = points.max(1);
        let now = self.clock.now_millis();
        let window_ms = self.policy.duration_secs.saturating_mul(1000);

        let mut records = self.records.lock().expect("rate limiter lock poisoned");
        let record = records
            .entry(key.to_string())
            .or_insert_with(|| ConsumptionRecord::new(key, now));

        match record.blocked_until {
            Some(until) if now < until => {
                return Err(Rejection {
                    retry_after: Duration::from_millis(until - now),
                    consumed: record.points_consumed,
                });
            }
            Some(_) => record.restart(now),
            None if now >= record.window_start.saturating_add(window_ms) => record.restart(now),
            None => {}
        }

        record.points_consumed = record.points_consumed.saturating_add(points);
        let window_end = record.window_start.saturating_add(window_ms);

        if record.points_consumed > self.policy.points {
            let until = if self.policy.block_duration_secs == 0 {
                window_end
            } else {
                now.saturating_add(self.policy.block_duration_secs.saturating_mul(1000))
            };
            record.blocked_until = Some(until);
            debug!(
                key = %key,
                consumed = record.points_consumed,
                limit = self.policy.points,
                "Rate limit exceeded, blocking key"
            );
            return Err(Rejection {
                retry_after: Duration::from_millis(until.saturating_sub(now)),
                consumed: record.points_consumed,
            });
        }

        Ok(Admission {
            remaining: self.policy.points - record.points_consumed,
            consumed: record.points_consumed,
            reset_after: Duration::from_millis(window_end.saturating_sub(now)),
        })
    }

    /// Points `key` could still consume right now, without consuming any.
    pub fn remaining(&self, key: &str) -> u32 {
        let now = self.clock.now_millis();
        let window_ms = self.policy.duration_secs.saturating_mul(1000);
        let records = self.records.lock().expect("rate limiter lock poisoned");
        match records.get(key) {
            None => self.policy.points,
            Some(r) => match r.blocked_until {
                Some(until) if now < until => 0,
                Some(_) => self.policy.points,
                None if now >= r.window_start.saturating_add(window_ms) => self.policy.points,
                None => self.policy.points.saturating_sub(r.points_consumed),
            },
        }
    }

    /// Snapshot of the record for `key`, if one is tracked.
    pub fn record(&self, key: &str) -> Option<ConsumptionRecord> {
        self.records
            .lock()
            .expect("rate limiter lock poisoned")
            .get(key)
            .cloned()
    }

    /// Forget everything about `key`.
    pub fn reset(&self, key: &str) {
        self.records
            .lock()
            .expect("rate limiter lock poisoned")
            .remove(key);
    }

    /// Drop records whose window has ended and which are not blocked.
    /// Returns the number removed.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now_millis();
        let window_ms = self.policy.duration_secs.saturating_mul(1000);
        let mut records = self.records.lock().expect("rate limiter lock poisoned");
        let before = records.len();
        records.retain(|_, r| match r.blocked_until {
            Some(until) => now < until,
            None => now < r.window_start.saturating_add(window_ms),
        });
        before - records.len()
    }

    pub fn len(&self) -> usize {
        self.records
            .lock()
            .expect("rate limiter lock poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run [`sweep`](Self::sweep) every `interval` until `shutdown_rx` turns `true`.
    pub fn spawn_sweeper(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            info!("Rate limiter sweeper shutting down");
                            return;
                        }
                    }
                    _ = tokio::time::sleep(interval) => {}
                }

                if *shutdown_rx.borrow() {
                    return;
                }

                let removed = self.sweep();
                if removed > 0 {
                    debug!(removed, remaining = self.len(), "Swept stale rate limit records");
                }
            }
        })
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("policy", &self.policy)
            .field("keys", &self.len())
            .finish()
    }
}

/// One limiter per [`PolicyName`], sharing a clock.
#[derive(Debug, Clone)]
pub struct RateLimiterSet {
    api: Arc<RateLimiter>,
    auth: Arc<RateLimiter>,
    speech: Arc<RateLimiter>,
}

impl RateLimiterSet {
    pub fn new(policies: &RateLimitPolicies) -> Result<Self> {
        Self::with_clock(policies, clock::monotonic())
    }

    pub fn with_clock(policies: &RateLimitPolicies, clock: SharedClock) -> Result<Self> {
        policies.validate()?;
        Ok(Self {
            api: Arc::new(RateLimiter::with_clock(policies.api, clock.clone())?),
            auth: Arc::new(RateLimiter::with_clock(policies.auth, clock.clone())?),
            speech: Arc::new(RateLimiter::with_clock(policies.speech, clock)?),
        })
    }

    pub fn get(&self, name: PolicyName) -> &Arc<RateLimiter> {
        match name {
            PolicyName::Api => &self.api,
            PolicyName::Auth => &self.auth,
            PolicyName::Speech => &self.speech,
        }
    }

    pub fn consume(&self, name: PolicyName, key: &str, points: u32) -> ConsumeResult {
        self.get(name).consume(key, points)
    }

    pub fn sweep(&self) -> usize {
        PolicyName::ALL.iter().map(|n| self.get(*n).sweep()).sum()
    }
}

// ============================================================================
// Tests
// ============================================================================
