//! Retry policy: decides backoff delays and when to give up.

use std::time::Duration;

use rand::Rng;

/// Retry policy for failed deliveries.
///
/// `delay = min(base_delay * 2^attempt_count, max_delay)`, plus jitter drawn
/// uniformly from `[0, delay * jitter_ratio)` so that tasks failing together
/// don't come back together.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,

    /// Deliveries allowed before dead-lettering.
    pub max_attempts: u32,

    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            max_attempts: 5,
            jitter_ratio: 0.1,
        }
    }
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_delay,
            max_attempts,
            ..Self::default()
        }
    }

    /// Capped exponential delay without jitter.
    ///
    /// Example with base_delay=1s, max_delay=300s:
    /// - attempt_count 1: 2s
    /// - attempt_count 2: 4s
    /// - attempt_count 3: 8s
    /// - attempt_count 9: 300s (capped)
    pub fn backoff(&self, attempt_count: u32) -> Duration {
        2u32.checked_pow(attempt_count)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    /// Delay before the next delivery, jitter included.
    pub fn next_delay(&self, attempt_count: u32) -> Duration {
        self.next_delay_with(attempt_count, &mut rand::thread_rng())
    }

    pub fn next_delay_with<R: Rng + ?Sized>(&self, attempt_count: u32, rng: &mut R) -> Duration {
        let delay = self.backoff(attempt_count);
        let spread = delay.as_secs_f64() * self.jitter_ratio;
        if spread <= 0.0 {
            return delay;
        }
        delay + Duration::from_secs_f64(rng.gen_range(0.0..spread))
    }

    /// `attempt_count >= max_attempts`.
    pub fn should_deadletter(&self, attempt_count: u32) -> bool {
        attempt_count >= self.max_attempts
    }

    /// Upper bound (exclusive) of `next_delay` for the given attempt.
    pub fn max_jittered(&self, attempt_count: u32) -> Duration {
        self.backoff(attempt_count).mul_f64(1.0 + self.jitter_ratio)
    }
}
