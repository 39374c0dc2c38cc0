//! Exponential backoff with jitter.

use std::time::Duration;

use rand::Rng;

use crate::job::ErrorClass;

/// Backoff parameters for failed jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
        }
    }

    /// Delay before the next attempt, jittered by a factor in `[0.5, 1.5)`.
    pub fn next_delay(&self, attempts: u32) -> Duration {
        self.next_delay_with(attempts, &mut rand::thread_rng())
    }

    pub fn next_delay_with<R: Rng + ?Sized>(&self, attempts: u32, rng: &mut R) -> Duration {
        self.backoff_ceiling(attempts)
            .mul_f64(rng.gen_range(0.5..1.5))
    }

    /// `min(max_delay, base_delay * 2^(attempts - 1))`, before jitter.
    pub fn backoff_ceiling(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1);
        let factor = 2u32.saturating_pow(exponent);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    pub fn should_retry(&self, attempts: u32, max_retries: u32, class: ErrorClass) -> bool {
        should_retry(attempts, max_retries, class)
    }
}

/// Free-function form of [`RetryPolicy::next_delay`].
pub fn next_attempt(attempts: u32, base_delay: Duration, max_delay: Duration) -> Duration {
    RetryPolicy::new(base_delay, max_delay).next_delay(attempts)
}

/// False once the retry budget is spent or the error cannot be retried.
pub fn should_retry(attempts: u32, max_retries: u32, class: ErrorClass) -> bool {
    attempts <= max_retries && class.is_retryable()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(60))
    }

    #[test]
    fn ceiling_doubles_until_capped() {
        let policy = policy();
        assert_eq!(policy.backoff_ceiling(1), Duration::from_secs(1));
        assert_eq!(policy.backoff_ceiling(2), Duration::from_secs(2));
        assert_eq!(policy.backoff_ceiling(4), Duration::from_secs(8));
        assert_eq!(policy.backoff_ceiling(7), Duration::from_secs(60));
        assert_eq!(policy.backoff_ceiling(u32::MAX), Duration::from_secs(60));

        let mut previous = Duration::ZERO;
        for attempts in 0..40 {
            let ceiling = policy.backoff_ceiling(attempts);
            assert!(ceiling >= previous);
            previous = ceiling;
        }
    }

    #[test]
    fn jitter_stays_within_half_to_one_and_a_half() {
        let policy = policy();
        let mut rng = StdRng::seed_from_u64(7);
        for attempts in 1..10 {
            let ceiling = policy.backoff_ceiling(attempts);
            for _ in 0..50 {
                let delay = policy.next_delay_with(attempts, &mut rng);
                assert!(delay >= ceiling.mul_f64(0.5));
                assert!(delay < ceiling.mul_f64(1.5));
            }
        }
    }

    #[test]
    fn retry_stops_exactly_past_budget() {
        for attempts in 0..=3 {
            assert!(should_retry(attempts, 3, ErrorClass::Retryable));
        }
        assert!(!should_retry(4, 3, ErrorClass::Retryable));
        assert!(should_retry(1, 3, ErrorClass::Timeout));
        assert!(!should_retry(1, 3, ErrorClass::NonRetryable));
        assert!(!should_retry(1, 3, ErrorClass::Cancelled));
    }
}
