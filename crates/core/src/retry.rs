use std::time::Duration;

use crate::task::ErrorClass;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries granted after the first attempt fails, so a task executes at
    /// most `max_retries + 1` times.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(60_000),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { delay: Duration },
    Abandon,
}

impl RetryPolicy {
    /// `attempt` is the 1-based number of the attempt that just failed.
    ///
    /// Pure: the same inputs always give the same decision.
    pub fn decide(&self, attempt: u32, class: ErrorClass) -> RetryDecision {
        if !class.is_transient() || attempt == 0 || attempt > self.max_retries {
            return RetryDecision::Abandon;
        }
        RetryDecision::Retry {
            delay: self.delay_for(attempt),
        }
    }

    /// `base * 2^(attempt-1)`, capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << shift)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}
