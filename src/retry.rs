use std::time::Duration;

use backon::ExponentialBuilder;
use rand::{Rng, rng};

/// Exponential backoff with jitter for reconnects and retried calls.
#[derive(Debug, Clone, Copy)]
pub struct RetryBackoffBuilder {
    pub min_base_delay: Duration,
    pub max_base_delay: Duration,
    pub max_retries: u32,
}

impl Default for RetryBackoffBuilder {
    fn default() -> Self {
        Self {
            min_base_delay: Duration::from_millis(100),
            max_base_delay: Duration::from_secs(5),
            max_retries: 5,
        }
    }
}

impl RetryBackoffBuilder {
    pub fn with_min_base_delay(self, min_base_delay: Duration) -> Self {
        Self {
            min_base_delay,
            ..self
        }
    }

    pub fn with_max_base_delay(self, max_base_delay: Duration) -> Self {
        Self {
            max_base_delay,
            ..self
        }
    }

    pub fn with_max_retries(self, max_retries: u32) -> Self {
        Self {
            max_retries,
            ..self
        }
    }

    pub fn build(self) -> RetryBackoff {
        RetryBackoff {
            min_base_delay: self.min_base_delay,
            max_base_delay: self.max_base_delay,
            max_attempts: self.max_retries,
            cur_attempt: 0,
        }
    }

    /// Same policy for unary calls retried through `backon`.
    pub(crate) fn to_backon(self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.min_base_delay)
            .with_max_delay(self.max_base_delay)
            .with_max_times(self.max_retries as usize)
            .with_jitter()
    }
}

#[derive(Debug)]
pub struct RetryBackoff {
    min_base_delay: Duration,
    max_base_delay: Duration,
    max_attempts: u32,
    cur_attempt: u32,
}

impl RetryBackoff {
    pub fn reset(&mut self) {
        self.cur_attempt = 0;
    }

    pub fn attempts_used(&self) -> u32 {
        self.cur_attempt
    }

    pub fn remaining(&self) -> u32 {
        self.max_attempts.saturating_sub(self.cur_attempt)
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining() == 0
    }
}

impl Iterator for RetryBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        if self.is_exhausted() {
            return None;
        }
        let base_delay = (self
            .min_base_delay
            .saturating_mul(2u32.saturating_pow(self.cur_attempt)))
        .min(self.max_base_delay);
        let jitter =
            Duration::try_from_secs_f64(base_delay.as_secs_f64() * rng().random_range(0.0..=1.0))
                .unwrap_or(Duration::MAX);
        let delay = base_delay.saturating_add(jitter);
        self.cur_attempt += 1;
        Some(delay)
    }
}
