//! Rate limit decisions.

use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::error::{GatekeeperError, Result};

/// Outcome of one [`RateLimiter::admit`](super::RateLimiter::admit) call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateDecision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Requests left in the window after this one; never above `limit`
    pub remaining: u64,
    /// When the quota is guaranteed to have room again.
    ///
    /// This is `now + window`, an upper bound: the oldest counted entry
    /// usually expires earlier.
    pub reset_at: DateTime<Utc>,
    /// Configured quota
    pub limit: u64,
    /// Window the quota applies to
    pub window: Duration,
    /// Reached without the store (store down or too slow)
    pub degraded: bool,
}

impl RateDecision {
    /// `reset_at` as whole epoch seconds, rounded up.
    pub fn reset_epoch_secs(&self) -> i64 {
        let millis = self.reset_at.timestamp_millis();
        (millis + 999).div_euclid(1000)
    }

    /// Turn a denial into [`GatekeeperError::LimitExceeded`].
    pub fn into_result(self, key: &str) -> Result<Self> {
        if self.allowed {
            Ok(self)
        } else {
            Err(GatekeeperError::LimitExceeded {
                key: key.to_string(),
                limit: self.limit,
                window: self.window,
            })
        }
    }
}
