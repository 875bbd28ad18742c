//! Retry policy: exponential backoff with bounded jitter.
//!
//! Every function here is pure. Randomness enters only through the explicit
//! `jitter_sample` argument so callers (and tests) control it.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Smallest base delay the policy accepts; keeps every backoff strictly positive.
pub const MIN_BASE_DELAY: Duration = Duration::from_millis(1);

/// Backoff configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay after the first failure.
    pub base_delay: Duration,
    /// Maximum delay cap (before jitter).
    pub max_delay: Duration,
    /// Jitter ratio (0.0-1.0): up to `ratio * delay` is added on top.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(Duration::from_secs(1), Duration::from_secs(300), 0.1)
    }
}

/// What to do with a job whose attempt just failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Back to `pending`, claimable again at `run_at`.
    Retry { run_at: DateTime<Utc>, delay: Duration },
    /// Retry budget spent; the job goes to the dead letter queue.
    Exhausted,
}

impl RetryPolicy {
    /// Create an exponential policy, normalizing out-of-range inputs.
    pub fn exponential(base_delay: Duration, max_delay: Duration, jitter: f64) -> Self {
        let base_delay = base_delay.max(MIN_BASE_DELAY);
        let jitter = if jitter.is_finite() { jitter.clamp(0.0, 1.0) } else { 0.0 };
        Self {
            base_delay,
            max_delay: max_delay.max(base_delay),
            jitter,
        }
    }

    /// A policy without jitter, for deterministic timing.
    pub fn without_jitter(mut self) -> Self {
        self.jitter = 0.0;
        self
    }

    /// `base_delay * 2^(attempts-1)`, capped at `max_delay`.
    ///
    /// `attempts` counts the failed attempt that triggers the computation, so
    /// the first failure (`attempts == 1`) yields `base_delay`. Zero is treated
    /// as one.
    pub fn backoff(&self, attempts: u32) -> Duration {
        let exp = attempts.max(1) - 1;
        let factor = 2u32.checked_pow(exp).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// [`backoff`](Self::backoff) plus jitter. `jitter_sample` is expected in
    /// `[0, 1)`; values outside are clamped.
    pub fn backoff_with_jitter(&self, attempts: u32, jitter_sample: f64) -> Duration {
        let delay = self.backoff(attempts);
        if self.jitter <= 0.0 {
            return delay;
        }
        let sample = if jitter_sample.is_finite() {
            jitter_sample.clamp(0.0, 1.0)
        } else {
            0.0
        };
        let extra = (delay.as_nanos() as f64 * self.jitter * sample).floor() as u64;
        delay.saturating_add(Duration::from_nanos(extra))
    }

    /// True while `attempts <= max_retries`.
    pub fn should_retry(&self, attempts: u32, max_retries: u32) -> bool {
        attempts <= max_retries
    }

    /// Decide the outcome after a failure, with `attempts` already incremented.
    pub fn decide(
        &self,
        attempts: u32,
        max_retries: u32,
        now: DateTime<Utc>,
        jitter_sample: f64,
    ) -> RetryDecision {
        if !self.should_retry(attempts, max_retries) {
            return RetryDecision::Exhausted;
        }
        let delay = self.backoff_with_jitter(attempts, jitter_sample);
        let offset = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
        let run_at = now.checked_add_signed(offset).unwrap_or(DateTime::<Utc>::MAX_UTC);
        RetryDecision::Retry { run_at, delay }
    }

    /// Draw a jitter sample from the thread-local RNG.
    pub fn sample_jitter() -> f64 {
        rand::random::<f64>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::exponential(Duration::from_millis(100), Duration::from_secs(10), 0.0)
    }

    #[test]
    fn exponential_backoff_calculates_correctly() {
        let policy = policy();

        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
        assert_eq!(policy.backoff(4), Duration::from_millis(800));
    }

    #[test]
    fn backoff_is_capped() {
        let policy = policy();
        assert_eq!(policy.backoff(20), Duration::from_secs(10));
        assert_eq!(policy.backoff(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn zero_attempts_behaves_like_first_failure() {
        assert_eq!(policy().backoff(0), Duration::from_millis(100));
    }

    #[test]
    fn zero_base_delay_is_normalized() {
        let policy = RetryPolicy::exponential(Duration::ZERO, Duration::ZERO, 0.0);
        assert_eq!(policy.backoff(1), MIN_BASE_DELAY);
    }

    #[test]
    fn jitter_is_bounded() {
        let policy = RetryPolicy::exponential(Duration::from_millis(100), Duration::from_secs(10), 0.5);

        assert_eq!(policy.backoff_with_jitter(1, 0.0), Duration::from_millis(100));
        assert_eq!(policy.backoff_with_jitter(1, 1.0), Duration::from_millis(150));
        assert_eq!(policy.backoff_with_jitter(1, 7.0), Duration::from_millis(150));
    }

    #[test]
    fn should_retry_respects_max_retries() {
        let policy = policy();

        assert!(policy.should_retry(1, 2));
        assert!(policy.should_retry(2, 2));
        assert!(!policy.should_retry(3, 2));
        assert!(!policy.should_retry(1, 0));
    }

    #[test]
    fn decide_schedules_or_exhausts() {
        let policy = policy();
        let now = Utc::now();

        match policy.decide(1, 2, now, 0.0) {
            RetryDecision::Retry { run_at, delay } => {
                assert_eq!(delay, Duration::from_millis(100));
                assert_eq!(run_at, now + chrono::Duration::milliseconds(100));
            }
            RetryDecision::Exhausted => panic!("expected retry"),
        }
        assert_eq!(policy.decide(3, 2, now, 0.0), RetryDecision::Exhausted);
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Property: backoff never decreases as attempts grow, and never exceeds the cap.
            #[test]
            fn backoff_is_monotonic_and_capped(
                base_ms in 1u64..10_000,
                max_ms in 1u64..1_000_000,
                attempts in 0u32..200,
            ) {
                let policy = RetryPolicy::exponential(
                    Duration::from_millis(base_ms),
                    Duration::from_millis(max_ms),
                    0.0,
                );
                let a = policy.backoff(attempts);
                let b = policy.backoff(attempts + 1);
                prop_assert!(a <= b);
                prop_assert!(b <= policy.max_delay);
            }

            /// Property: backoff is always strictly positive, with or without jitter.
            #[test]
            fn backoff_is_positive(
                base_ms in 0u64..10_000,
                attempts in 0u32..100,
                jitter in 0.0f64..1.0,
                sample in 0.0f64..1.0,
            ) {
                let policy = RetryPolicy::exponential(
                    Duration::from_millis(base_ms),
                    Duration::from_secs(60),
                    jitter,
                );
                prop_assert!(policy.backoff(attempts) > Duration::ZERO);
                prop_assert!(policy.backoff_with_jitter(attempts, sample) >= policy.backoff(attempts));
            }
        }
    }
}
