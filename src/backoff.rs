//! Exponential backoff used to quarantine dead proxies.

use crate::error::ConfigError;

use rand::Rng;
use std::time::{Duration, Instant};

/// Bounds of the quarantine delays handed out by [`ExponentialBackoff`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    /// Delay of the first quarantine.
    pub base: Duration,
    /// Upper bound on any delay.
    pub cap: Duration,
    /// Sample each delay uniformly from `[0, bound)` instead of using the bound itself.
    pub jitter: bool,
}

impl BackoffPolicy {
    /// Check that the bounds describe a usable backoff.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base.is_zero() || self.cap < self.base {
            return Err(ConfigError::InvalidBackoff {
                base: self.base,
                cap: self.cap,
            });
        }
        Ok(())
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(300),
            cap: Duration::from_secs(3600),
            jitter: true,
        }
    }
}

/// Capped exponential backoff, one instance per proxy.
///
/// `base` and `cap` are private and fixed at construction.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    attempts: u32,
    base: Duration,
    cap: Duration,
    jitter: bool,
    // log2(cap / base); from here on every delay is the cap
    max_attempts: f64,
    amount: Duration,
    ready_at: Option<Instant>,
}

impl ExponentialBackoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        let max_attempts = (policy.cap.as_secs_f64() / policy.base.as_secs_f64()).log2();
        Self {
            attempts: 0,
            base: policy.base,
            cap: policy.cap,
            jitter: policy.jitter,
            max_attempts,
            amount: Duration::ZERO,
            ready_at: None,
        }
    }

    /// Consecutive failures since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn cap(&self) -> Duration {
        self.cap
    }

    /// Attempt count from which every delay equals the cap.
    pub fn max_attempts(&self) -> f64 {
        self.max_attempts
    }

    /// Last computed delay.
    pub fn current_amount(&self) -> Duration {
        self.amount
    }

    /// When the current quarantine ends, `None` until the first trigger.
    pub fn ready_at(&self) -> Option<Instant> {
        self.ready_at
    }

    /// Upper bound of the delay for a given attempt count: `min(base * 2^attempts, cap)`.
    ///
    /// The comparison against `max_attempts` happens before exponentiation so large
    /// attempt counts never overflow.
    pub fn bound(&self, attempts: u32) -> Duration {
        if f64::from(attempts) < self.max_attempts {
            self.base.mul_f64(2f64.powi(attempts as i32))
        } else {
            self.cap
        }
    }

    /// Start a new quarantine at `now`.
    ///
    /// The delay is computed from the attempt count before it is incremented, so the
    /// first quarantine lasts `base` (or a jittered fraction of it).
    pub fn trigger<R: Rng + ?Sized>(&mut self, now: Instant, rng: &mut R) {
        let bound = self.bound(self.attempts);
        self.amount = if self.jitter {
            bound.mul_f64(rng.random::<f64>())
        } else {
            bound
        };
        self.ready_at = Some(now + self.amount);
        self.attempts = self.attempts.saturating_add(1);
    }

    /// Zero the attempt counter. `ready_at` is left alone.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn policy(base: u64, cap: u64, jitter: bool) -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_secs(base),
            cap: Duration::from_secs(cap),
            jitter,
        }
    }

    #[test]
    fn test_plain_delays_double_until_cap() {
        let mut backoff = ExponentialBackoff::new(policy(300, 3600, false));
        let mut rng = StdRng::seed_from_u64(1);
        let now = Instant::now();

        let mut seen = Vec::new();
        for _ in 0..8 {
            backoff.trigger(now, &mut rng);
            seen.push(backoff.current_amount().as_secs());
        }

        assert_eq!(seen, vec![300, 600, 1200, 2400, 3600, 3600, 3600, 3600]);
        assert_eq!(backoff.attempts(), 8);
    }

    #[test]
    fn test_bound_matches_min_formula() {
        let backoff = ExponentialBackoff::new(policy(7, 1000, false));
        for attempts in 0..40u32 {
            let expected = (7f64 * 2f64.powi(attempts as i32)).min(1000.0);
            assert!(
                (backoff.bound(attempts).as_secs_f64() - expected).abs() < 1e-9,
                "attempts {attempts}"
            );
        }
    }

    #[test]
    fn test_clamped_after_ceil_log2() {
        let backoff = ExponentialBackoff::new(policy(300, 3600, false));
        let clamp_from = (3600f64 / 300f64).log2().ceil() as u32;
        assert_eq!(clamp_from, 4);
        for attempts in clamp_from..clamp_from + 100 {
            assert_eq!(backoff.bound(attempts), Duration::from_secs(3600));
        }
        assert_eq!(backoff.bound(u32::MAX), Duration::from_secs(3600));
    }

    #[test]
    fn test_exact_power_of_two_ratio_reaches_cap() {
        let backoff = ExponentialBackoff::new(policy(1, 8, false));
        assert_eq!(backoff.bound(2), Duration::from_secs(4));
        assert_eq!(backoff.bound(3), Duration::from_secs(8));
    }

    #[test]
    fn test_jittered_delay_below_bound() {
        let mut backoff = ExponentialBackoff::new(policy(10, 100, true));
        let mut rng = StdRng::seed_from_u64(42);
        let now = Instant::now();

        for attempts in 0..20 {
            let bound = backoff.bound(attempts);
            backoff.trigger(now, &mut rng);
            assert!(backoff.current_amount() < bound);
            assert_eq!(backoff.ready_at(), Some(now + backoff.current_amount()));
        }
    }

    #[test]
    fn test_reset_keeps_ready_at() {
        let mut backoff = ExponentialBackoff::new(policy(5, 50, false));
        let mut rng = StdRng::seed_from_u64(0);
        let now = Instant::now();
        assert_eq!(backoff.ready_at(), None);

        backoff.trigger(now, &mut rng);
        backoff.trigger(now, &mut rng);
        backoff.reset();

        assert_eq!(backoff.attempts(), 0);
        assert_eq!(backoff.ready_at(), Some(now + Duration::from_secs(10)));

        backoff.trigger(now, &mut rng);
        assert_eq!(backoff.current_amount(), Duration::from_secs(5));
    }

    #[test]
    fn test_policy_validation() {
        assert!(policy(300, 3600, true).validate().is_ok());
        assert!(policy(10, 10, true).validate().is_ok());
        assert!(matches!(
            policy(0, 10, true).validate(),
            Err(ConfigError::InvalidBackoff { .. })
        ));
        assert!(matches!(
            policy(20, 10, false).validate(),
            Err(ConfigError::InvalidBackoff { .. })
        ));
    }
}
