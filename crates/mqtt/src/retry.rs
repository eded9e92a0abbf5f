//! Bounded, fixed-delay retry budget for connection establishment.
//!
//! Broker availability at startup is not guaranteed (containers come up in any
//! order), so connecting is retried a fixed number of times with a constant
//! pause in between. Running out of attempts is final.
//!
//! ```text
//! attempt 1 ── fail ── wait delay ── attempt 2 ── fail ── ... ── attempt N ── fail ── Exhausted
//! ```

use std::time::Duration;

use thiserror::Error;

/// Returned when the retry budget is spent.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RetryError {
    #[error("Maximum number of attempts exceeded: {0}")]
    Exhausted(u32),
}

/// Tracks failed attempts against a fixed budget.
///
/// Call [`RetryBudget::next_delay`] after every failed attempt: it returns the
/// pause before the next attempt, or [`RetryError::Exhausted`] when the failed
/// attempt was the last one allowed.
#[derive(Debug, Clone)]
pub struct RetryBudget {
    max_attempts: u32,
    delay: Duration,
    failed: u32,
}

impl RetryBudget {
    /// A budget of `max_attempts` total attempts (at least one) separated by `delay`.
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
            failed: 0,
        }
    }

    /// Records a failed attempt.
    pub fn next_delay(&mut self) -> Result<Duration, RetryError> {
        self.failed += 1;
        if self.failed >= self.max_attempts {
            return Err(RetryError::Exhausted(self.max_attempts));
        }
        Ok(self.delay)
    }

    /// Number of the attempt about to be made (1-based).
    pub fn attempt(&self) -> u32 {
        self.failed + 1
    }

    pub fn failed(&self) -> u32 {
        self.failed
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }
}

impl Default for RetryBudget {
    /// Ten attempts, one second apart.
    fn default() -> Self {
        Self::new(10, Duration::from_secs(1))
    }
}
