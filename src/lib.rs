//! callguard: guards for expensive outbound API calls.
//!
//! Three independent building blocks:
//!
//! - [`limiter`]: per-key fixed-window rate limiting with a block period
//!   once a key runs out of points, plus named `api`/`auth`/`speech` policies.
//! - [`cache`]: an LRU response cache with per-entry TTL and optional JSON
//!   snapshot persistence flushed in the background.
//! - [`pool`]: a generic async connection pool with a size ceiling, FIFO
//!   waiters and an acquire timeout.
//!
//! All time-dependent logic reads from a [`clock::Clock`] so tests can drive
//! it deterministically.

pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod limiter;
pub mod pool;

pub use cache::{CacheEntry, CacheStats, ResponseCache};
pub use clock::{Clock, ManualClock, MonotonicClock, SharedClock, SystemClock};
pub use config::{CacheConfig, Config, PoolConfig};
pub use error::{GuardError, Result};
pub use limiter::{
    Admission, ConsumeResult, PolicyName, RateLimitPolicies, RateLimitPolicy, RateLimiter,
    RateLimiterSet, Rejection,
};
pub use pool::{ManageConnection, Pool, PoolState, PooledConnection};
