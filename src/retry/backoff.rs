//! Backoff delay schedules
//!
//! A [`BackoffSequence`] is a finite iterator of delays. The first value is
//! consumed before the first attempt, so with `immediate` set the first
//! attempt runs without waiting.

use std::time::Duration;

use crate::error::{RelayError, Result};

/// Growth function applied to the delay after every non-immediate step
pub type GrowthFn = fn(Duration) -> Duration;

/// Default growth: double the previous delay
pub fn double(delay: Duration) -> Duration {
    delay.saturating_mul(2)
}

/// Backoff policy configuration
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    /// Total number of delays produced, the immediate one included
    pub max_results: u32,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Yield a zero delay first
    pub immediate: bool,
    /// First non-zero delay
    pub initial_delay: Duration,
    /// How the delay grows between steps
    pub growth: GrowthFn,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_results: 10,
            max_delay: Duration::from_secs(120),
            immediate: true,
            initial_delay: Duration::from_millis(10),
            growth: double,
        }
    }
}

impl BackoffPolicy {
    /// Check that the policy can produce at least one attempt
    pub fn validate(&self) -> Result<()> {
        if self.max_results == 0 {
            return Err(RelayError::InvalidConfig(
                "backoff max_results must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    /// Start a fresh sequence for one call
    pub fn sequence(&self) -> BackoffSequence {
        BackoffSequence::new(self)
    }
}

/// Finite iterator over retry delays
#[derive(Debug, Clone)]
pub struct BackoffSequence {
    remaining: u32,
    immediate_pending: bool,
    current_delay: Duration,
    max_delay: Duration,
    growth: GrowthFn,
}

impl BackoffSequence {
    pub fn new(policy: &BackoffPolicy) -> Self {
        Self {
            remaining: policy.max_results,
            immediate_pending: policy.immediate,
            current_delay: policy.initial_delay,
            max_delay: policy.max_delay,
            growth: policy.growth,
        }
    }

    /// Number of delays still to be produced
    pub fn remaining(&self) -> u32 {
        self.remaining
    }
}

impl Iterator for BackoffSequence {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;

        if self.immediate_pending {
            self.immediate_pending = false;
            return Some(Duration::ZERO);
        }

        let delay = self.current_delay.min(self.max_delay);
        self.current_delay = (self.growth)(self.current_delay);
        Some(delay)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.remaining as usize;
        (n, Some(n))
    }
}

impl ExactSizeIterator for BackoffSequence {}
