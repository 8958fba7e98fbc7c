//! Response caching with TTL, LRU eviction, and JSON persistence.

pub mod persist;
pub mod response_cache;

pub use response_cache::{CacheEntry, CacheStats, ResponseCache};
