//! Rate-limit policies and the named policy set.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{GuardError, Result};

/// Points per window, window length, and the cooldown applied once a key
/// goes over quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    /// Maximum points a key may consume per window.
    pub points: u32,
    /// Window length in seconds.
    #[serde(alias = "duration")]
    pub duration_secs: u64,
    /// Cooldown in seconds once the quota is exceeded. `0` blocks until the
    /// current window ends.
    #[serde(default, alias = "blockDuration", alias = "block_duration")]
    pub block_duration_secs: u64,
}

impl RateLimitPolicy {
    pub const fn new(points: u32, duration_secs: u64, block_duration_secs: u64) -> Self {
        Self {
            points,
            duration_secs,
            block_duration_secs,
        }
    }

    /// Reject non-positive `points` or `duration_secs`.
    pub fn validate(&self) -> Result<()> {
        if self.points == 0 {
            return Err(GuardError::InvalidPolicy(
                "points must be at least 1".to_string(),
            ));
        }
        if self.duration_secs == 0 {
            return Err(GuardError::InvalidPolicy(
                "duration_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs)
    }

    pub fn block_duration(&self) -> Duration {
        Duration::from_secs(self.block_duration_secs)
    }
}

/// Endpoint categories with their own policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyName {
    Api,
    Auth,
    Speech,
}

impl PolicyName {
    pub const ALL: [PolicyName; 3] = [PolicyName::Api, PolicyName::Auth, PolicyName::Speech];

    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyName::Api => "api",
            PolicyName::Auth => "auth",
            PolicyName::Speech => "speech",
        }
    }
}

impl std::fmt::Display for PolicyName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One policy per endpoint category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitPolicies {
    /// General API traffic: 100 requests per minute, blocked for a minute.
    pub api: RateLimitPolicy,
    /// Login attempts: 5 per 5 minutes, blocked for 15 minutes.
    pub auth: RateLimitPolicy,
    /// Speech/transcription calls: 50 per hour, blocked for 30 minutes.
    pub speech: RateLimitPolicy,
}

impl Default for RateLimitPolicies {
    fn default() -> Self {
        Self {
            api: RateLimitPolicy::new(100, 60, 60),
            auth: RateLimitPolicy::new(5, 300, 900),
            speech: RateLimitPolicy::new(50, 3600, 1800),
        }
    }
}

impl RateLimitPolicies {
    pub fn get(&self, name: PolicyName) -> &RateLimitPolicy {
        match name {
            PolicyName::Api => &self.api,
            PolicyName::Auth => &self.auth,
            PolicyName::Speech => &self.speech,
        }
    }

    /// Validate every policy, naming the offending category on failure.
    pub fn validate(&self) -> Result<()> {
        for name in PolicyName::ALL {
            self.get(name).validate().map_err(|e| match e {
                GuardError::InvalidPolicy(msg) => {
                    GuardError::InvalidPolicy(format!("{}: {}", name, msg))
                }
                other => other,
            })?;
        }
        Ok(())
    }
}
