//! Reconnection backoff.
//!
//! The first retry after a fault is immediate, then delays double from [`DEFAULT_BASE_DELAY`]
//! until they reach [`DEFAULT_MAX_DELAY`], where they stay for as long as the outage lasts.

use std::time::Duration;

/// Delay before the second reconnection attempt.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(10_000);

/// Upper bound for any single reconnection delay.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_millis(320_000);

/// Capped exponential backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: DEFAULT_BASE_DELAY,
            max: DEFAULT_MAX_DELAY,
        }
    }
}

impl Backoff {
    /// Create a backoff policy from a base delay and a cap.
    pub const fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// The delay before the second attempt.
    pub const fn base(&self) -> Duration {
        self.base
    }

    /// The maximum delay between attempts.
    pub const fn max(&self) -> Duration {
        self.max
    }

    /// Delay to wait given the number of attempts already made.
    ///
    /// Zero attempts means no wait at all, otherwise `base * 2^(attempts - 1)`, capped
    /// at `max`.
    pub fn delay(&self, attempts: u32) -> Duration {
        if attempts == 0 {
            return Duration::ZERO;
        }

        let factor = 2u32.checked_pow(attempts - 1).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map_or(self.max, |delay| delay.min(self.max))
    }
}

/// Counts reconnection attempts for one recovery sequence.
///
/// A count of zero means no recovery is in progress.
#[derive(Debug, Clone, Default)]
pub struct ReconnectCounter {
    policy: Backoff,
    attempts: u32,
}

impl ReconnectCounter {
    /// Create a counter at zero for the given policy.
    pub fn new(policy: Backoff) -> Self {
        Self {
            policy,
            attempts: 0,
        }
    }

    /// Number of attempts made so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Whether a recovery sequence is currently using this counter.
    pub fn is_active(&self) -> bool {
        self.attempts > 0
    }

    /// Compute the delay for the next attempt and count it.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.policy.delay(self.attempts);
        self.attempts = self.attempts.saturating_add(1);
        delay
    }

    /// Reset to zero, ending the recovery sequence.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    /// The policy used for delays.
    pub fn policy(&self) -> &Backoff {
        &self.policy
    }
}
