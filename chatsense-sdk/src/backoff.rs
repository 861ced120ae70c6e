//! Reconnect policy: bounded exponential backoff with additive jitter.

use std::time::Duration;

use rand::Rng;

/// How the stream client retries a dropped or failed connection.
///
/// The delay before retry `n` (0-based) is
/// `min(max_delay, base_delay * 2^n) + uniform(0, max_jitter)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Reconnect attempts allowed before giving up.
    pub max_attempts: u32,
    /// Delay before the first retry (jitter excluded).
    pub base_delay: Duration,
    /// Upper bound on the exponential part of the delay.
    pub max_delay: Duration,
    /// Upper bound on the random amount added to each delay.
    pub max_jitter: Duration,
    /// How long an open may take before it counts as failed.
    pub open_timeout: Duration,
    /// Pause between disconnect and connect for a user-initiated reconnect.
    pub reconnect_grace: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            max_jitter: Duration::from_millis(1000),
            open_timeout: Duration::from_secs(20),
            reconnect_grace: Duration::from_millis(1000),
        }
    }
}

impl RetryPolicy {
    pub fn validate(&self) -> Result<(), String> {
        if self.base_delay.is_zero() {
            return Err("Base reconnect delay must be > 0".to_string());
        }
        if self.max_delay < self.base_delay {
            return Err("Max reconnect delay must be >= base reconnect delay".to_string());
        }
        if self.open_timeout.is_zero() {
            return Err("Open timeout must be > 0".to_string());
        }
        Ok(())
    }

    /// The deterministic part of the delay before retry `attempt`.
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        2u32.checked_pow(attempt)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    /// Full delay before retry `attempt`, jitter included.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay_for(attempt) + self.jitter()
    }

    fn jitter(&self) -> Duration {
        let max = self.max_jitter.as_millis() as u64;
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max))
    }
}

/// Snapshot of the retry counter, for display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryState {
    pub attempt: u32,
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryState {
    pub fn remaining(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempt)
    }
}
