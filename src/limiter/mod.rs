//! Per-key rate limiting with named endpoint policies.

#[cfg(feature = "http")]
pub mod middleware;
pub mod policy;
pub mod rate_limiter;

pub use policy::{PolicyName, RateLimitPolicies, RateLimitPolicy};
pub use rate_limiter::{
    Admission, ConsumeResult, ConsumptionRecord, RateLimiter, RateLimiterSet, Rejection,
};
