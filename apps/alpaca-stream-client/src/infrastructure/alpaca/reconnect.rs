//! Reconnection Policy
//!
//! Delay schedule between transport handshake attempts. Fixed by default;
//! [`ConnectionSettings::connect_backoff_max`] switches to exponential
//! backoff with jitter.
//!
//! [`ConnectionSettings::connect_backoff_max`]: super::connection::ConnectionSettings::connect_backoff_max

use std::time::Duration;

use rand::Rng;

/// Shape of the delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Same delay after every failure.
    Fixed(Duration),
    /// Doubles after every failure, capped at `max`.
    Exponential {
        /// Delay after the first failure.
        initial: Duration,
        /// Upper bound on any single delay.
        max: Duration,
    },
}

impl Backoff {
    /// Delay after the `failures`-th failure (1-based), before jitter.
    #[must_use]
    pub fn delay(&self, failures: u32) -> Duration {
        match *self {
            Self::Fixed(delay) => delay,
            Self::Exponential { initial, max } => {
                let doublings = failures.saturating_sub(1).min(31);
                initial.saturating_mul(1 << doublings).min(max)
            }
        }
    }
}

/// Retry budget and schedule.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Delay schedule.
    pub backoff: Backoff,
    /// Jitter as a fraction of each delay (0.1 = ±10%).
    pub jitter_factor: f64,
    /// Total number of attempts (0 = unlimited).
    pub max_attempts: u32,
}

impl ReconnectConfig {
    /// Same delay between every attempt, no jitter.
    #[must_use]
    pub const fn fixed(delay: Duration, max_attempts: u32) -> Self {
        Self {
            backoff: Backoff::Fixed(delay),
            jitter_factor: 0.0,
            max_attempts,
        }
    }

    /// Exponential backoff with ±10% jitter.
    #[must_use]
    pub const fn exponential(initial: Duration, max: Duration, max_attempts: u32) -> Self {
        Self {
            backoff: Backoff::Exponential { initial, max },
            jitter_factor: 0.1,
            max_attempts,
        }
    }
}

/// Attempt counter for one sequence of handshakes.
///
/// Call [`Self::next_delay`] after each failed attempt; `None` means the
/// attempt budget is spent.
///
/// # Example
///
/// ```rust
/// use alpaca_stream_client::infrastructure::alpaca::reconnect::{ReconnectConfig, ReconnectPolicy};
/// use std::time::Duration;
///
/// let mut policy = ReconnectPolicy::new(ReconnectConfig::fixed(Duration::from_secs(1), 3));
///
/// assert_eq!(policy.next_delay(), Some(Duration::from_secs(1)));
/// assert_eq!(policy.next_delay(), Some(Duration::from_secs(1)));
/// assert_eq!(policy.next_delay(), None);
/// ```
#[derive(Debug)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    failures: u32,
}

impl ReconnectPolicy {
    /// Start a fresh sequence.
    #[must_use]
    pub const fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            failures: 0,
        }
    }

    /// Record a failed attempt and get the delay before the next one.
    ///
    /// Returns `None` if that failure used up the last attempt.
    #[must_use]
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.failures = self.failures.saturating_add(1);
        if !self.should_retry() {
            return None;
        }
        Some(jittered(
            self.config.backoff.delay(self.failures),
            self.config.jitter_factor,
        ))
    }

    /// Failed attempts recorded so far.
    #[must_use]
    pub const fn failures(&self) -> u32 {
        self.failures
    }

    /// Check if another attempt is allowed.
    #[must_use]
    pub const fn should_retry(&self) -> bool {
        self.config.max_attempts == 0 || self.failures < self.config.max_attempts
    }
}

fn jittered(delay: Duration, factor: f64) -> Duration {
    if factor <= 0.0 || delay.is_zero() {
        return delay;
    }
    let spread = delay.as_secs_f64() * factor;
    let offset = rand::rng().random_range(-spread..=spread);
    Duration::from_secs_f64((delay.as_secs_f64() + offset).max(0.001))
}
