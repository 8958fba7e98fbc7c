//! Error types for callguard.
//!
//! Hot-path outcomes (a rejected rate-limit check, a cache miss) are plain
//! values and never surface here unless the caller opts in via `?`. The
//! variants below cover misconfiguration, pool-level resource failures and
//! persistence problems.

use std::time::Duration;

use thiserror::Error;

/// Errors produced by the limiter, cache and pool.
#[derive(Debug, Error)]
pub enum GuardError {
    /// A rate-limit policy failed validation at construction time.
    #[error("invalid rate limit policy: {0}")]
    InvalidPolicy(String),

    /// Cache or pool options failed validation at construction time.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The key is over its quota. Produced only when a [`Rejection`] is
    /// converted for `?` propagation.
    ///
    /// [`Rejection`]: crate::limiter::Rejection
    #[error("rate limited, retry after {}s", retry_after.as_secs_f64().ceil() as u64)]
    RateLimited { retry_after: Duration },

    /// No pooled connection became free before the acquire timeout.
    #[error("connection pool exhausted after waiting {waited:?}")]
    PoolExhausted { waited: Duration },

    /// The pool was closed while the caller was waiting, or before it asked.
    #[error("connection pool is closed")]
    PoolClosed,

    /// The connection factory could not open a new backend connection.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Reading or writing the cache snapshot failed.
    #[error("cache persistence error: {0}")]
    Persistence(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl GuardError {
    /// `true` for outcomes a caller should treat as transient overload
    /// (fail the current request, do not retry in a tight loop).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GuardError::RateLimited { .. } | GuardError::PoolExhausted { .. }
        )
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, GuardError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limited_display_rounds_up() {
        let err = GuardError::RateLimited {
            retry_after: Duration::from_millis(29_200),
        };
        assert_eq!(err.to_string(), "rate limited, retry after 30s");
    }

    #[test]
    fn test_transient_classification() {
        assert!(GuardError::PoolExhausted {
            waited: Duration::from_millis(100)
        }
        .is_transient());
        assert!(!GuardError::BackendUnavailable("refused".into()).is_transient());
        assert!(!GuardError::InvalidPolicy("points".into()).is_transient());
    }

    #[test]
    fn test_io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: GuardError = io.into();
        assert!(matches!(err, GuardError::Io(_)));
    }
}
