//! Per-member rate limit for revoke requests.
//!
//! Keyed on `(guild_id, user_id)` with a token bucket: `requests` calls are
//! allowed per `period`, refilling evenly.

use std::num::NonZeroU32;
use std::time::Duration;

use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};

use crate::error::AppError;

pub struct RevokeRateLimiter {
    limiter: DefaultKeyedRateLimiter<(i64, i64)>,
}

impl RevokeRateLimiter {
    pub fn new(requests: u32, period: Duration) -> Self {
        let burst = NonZeroU32::new(requests).unwrap_or(NonZeroU32::MIN);
        let quota = Quota::with_period(period / burst.get())
            .unwrap_or_else(|| Quota::per_second(burst))
            .allow_burst(burst);

        Self {
            limiter: RateLimiter::keyed(quota),
        }
    }

    pub fn check(&self, guild_id: i64, user_id: i64) -> Result<(), AppError> {
        self.limiter.check_key(&(guild_id, user_id)).map_err(|_| {
            tracing::debug!(guild_id, user_id, "Revoke rate limit exceeded");
            AppError::RateLimited
        })
    }

    /// Drops buckets that have fully refilled. Returns how many keys remain.
    pub fn cleanup(&self) -> usize {
        self.limiter.retain_recent();
        self.limiter.shrink_to_fit();
        self.limiter.len()
    }
}
