//! Exponential backoff for automatic re-sync.
//!
//! The counter is owned by the engine and spans passes, not records: it counts
//! how many automatic retries have been scheduled since the last fresh attempt
//! window (connectivity regained, manual refresh) or the last clean pass.

use std::time::Duration;

/// Default delay before the first automatic retry.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);
/// Default number of automatic retries before giving up until the next
/// connectivity regain or manual refresh.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: DEFAULT_BASE_DELAY,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_retries: u32) -> Self {
        Self {
            base_delay,
            max_retries,
        }
    }

    /// Delay before the `n`th scheduled retry (1-based): `base * 2^(n-1)`.
    ///
    /// `None` for `n == 0` or past the ceiling.
    pub fn delay_for(&self, n: u32) -> Option<Duration> {
        if n == 0 || n > self.max_retries {
            return None;
        }
        let factor = 2u32.checked_pow(n - 1).unwrap_or(u32::MAX);
        Some(
            self.base_delay
                .checked_mul(factor)
                .unwrap_or(Duration::MAX),
        )
    }
}

/// Engine-level retry counter driven by a [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    scheduled: u32,
}

impl Backoff {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            scheduled: 0,
        }
    }

    /// Number of retries scheduled since the last reset.
    pub fn scheduled(&self) -> u32 {
        self.scheduled
    }

    pub fn is_exhausted(&self) -> bool {
        self.scheduled >= self.policy.max_retries
    }

    /// Consumes one retry from the budget and returns its delay, or `None`
    /// once the ceiling is reached.
    pub fn next_delay(&mut self) -> Option<(u32, Duration)> {
        let n = self.scheduled + 1;
        let delay = self.policy.delay_for(n)?;
        self.scheduled = n;
        Some((n, delay))
    }

    pub fn reset(&mut self) {
        self.scheduled = 0;
    }
}
