use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};

use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};

use crate::error::{ApiError, Result};

/// Checks between sweeps of keys whose quota has fully replenished.
const PRUNE_EVERY: u64 = 1024;

/// Per-key attempt limiter for sign-in and sign-up.
pub struct AttemptLimiter {
    limiter: DefaultKeyedRateLimiter<String>,
    checks: AtomicU64,
}

impl AttemptLimiter {
    pub fn per_minute(attempts: u32) -> Self {
        let attempts = NonZeroU32::new(attempts).unwrap_or(NonZeroU32::MIN);
        Self::with_quota(Quota::per_minute(attempts))
    }

    pub fn with_quota(quota: Quota) -> Self {
        Self {
            limiter: RateLimiter::keyed(quota),
            checks: AtomicU64::new(0),
        }
    }

    pub fn check(&self, key: &str) -> Result<()> {
        if self.checks.fetch_add(1, Ordering::Relaxed) % PRUNE_EVERY == PRUNE_EVERY - 1 {
            self.prune();
        }
        self.limiter
            .check_key(&key.to_string())
            .map_err(|_| {
                tracing::warn!("Rate limit exceeded for {}", key);
                ApiError::RateLimited
            })
    }

    /// Drop keys that are back at a full quota.
    pub fn prune(&self) {
        let before = self.limiter.len();
        self.limiter.retain_recent();
        self.limiter.shrink_to_fit();
        tracing::debug!("Rate limiter pruned {} -> {} keys", before, self.limiter.len());
    }

    /// Number of tracked keys.
    pub fn len(&self) -> usize {
        self.limiter.len()
    }

    pub fn is_empty(&self) -> bool {
        self.limiter.is_empty()
    }
}
