use rand::Rng;
use std::time::Duration;

/// Exponential backoff for retryable failures.
///
/// `delay(n) = min(base * 2^(n-1), max_delay)`, then shortened by up to
/// `jitter` (a fraction in `0.0..=1.0`) so competing workers spread out.
/// Jitter never pushes a delay above the cap.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            ..Default::default()
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Backoff before attempt `attempt + 1`, where `attempt` is the
    /// 1-indexed attempt that just failed.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let capped = self.undithered_delay(attempt);
        if self.jitter <= 0.0 || capped.is_zero() {
            return capped;
        }

        let factor = rand::thread_rng().gen_range((1.0 - self.jitter)..=1.0);
        capped.mul_f64(factor)
    }

    fn undithered_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exp = 2u32.checked_pow(attempt - 1).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(exp)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Whether another attempt is allowed after `attempt` attempts.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}
