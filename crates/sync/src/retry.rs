//! Backoff between delivery attempts of a transiently failing action.
//!
//! The delay doubles with every failure, starting at `base_delay` and capped
//! at `max_delay`. A small deterministic spread keeps partitions that failed
//! together from hammering the server in the same instant.

use std::time::Duration;

use chrono::{DateTime, Utc};

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Failed attempts after which an action is dead-lettered.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of the delay used as spread, in `0.0..=1.0`.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(300),
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// No delay between attempts: every cycle tries again.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: 0.0,
        }
    }

    /// Wait before the next attempt of an action that failed `failures` times.
    pub fn backoff(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }

        let base = u64::try_from(self.base_delay.as_millis()).unwrap_or(u64::MAX);
        let cap = u64::try_from(self.max_delay.as_millis()).unwrap_or(u64::MAX);
        let shift = (failures - 1).min(32);
        let nominal = base.saturating_mul(1u64 << shift).min(cap);

        // Offset in [-1.0, 1.0], fixed per failure count.
        let offset = f64::from((failures % 21) * 37 % 21) / 10.0 - 1.0;
        let spread = nominal as f64 * self.jitter.clamp(0.0, 1.0) * offset;

        Duration::from_millis((nominal as f64 + spread).max(0.0) as u64)
    }

    /// Earliest instant the next attempt may run; `None` when there is no wait.
    pub fn retry_at(&self, failures: u32, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let wait = self.backoff(failures);
        if wait.is_zero() {
            return None;
        }
        chrono::Duration::from_std(wait).ok().map(|wait| now + wait)
    }

    /// Whether an action that failed `failures` times gets another attempt.
    pub fn has_attempts_left(&self, failures: u32) -> bool {
        failures < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn without_jitter() -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            jitter: 0.0,
            ..RetryPolicy::default()
        }
    }

    #[test]
    fn delay_doubles_until_the_cap() {
        let policy = without_jitter();
        let waits: Vec<u128> = (0..=6).map(|n| policy.backoff(n).as_millis()).collect();
        assert_eq!(waits, vec![0, 100, 200, 400, 800, 1000, 1000]);
        assert_eq!(policy.backoff(u32::MAX), Duration::from_secs(1));
    }

    #[test]
    fn default_spread_is_bounded() {
        let policy = RetryPolicy::default();
        for failures in 1..12 {
            let nominal = (2_000u64 << (failures - 1)).min(300_000) as f64;
            let wait = policy.backoff(failures).as_millis() as f64;
            assert!(
                (nominal * 0.9 - 1.0..=nominal * 1.1 + 1.0).contains(&wait),
                "failure {failures}: {wait}ms vs {nominal}ms"
            );
        }
    }

    #[test]
    fn attempts_are_bounded() {
        let policy = RetryPolicy::immediate(3);
        assert!(policy.has_attempts_left(0));
        assert!(policy.has_attempts_left(2));
        assert!(!policy.has_attempts_left(3));
    }

    #[test]
    fn retry_at_is_none_without_wait() {
        let now = Utc::now();
        assert_eq!(RetryPolicy::immediate(3).retry_at(1, now), None);

        let at = without_jitter().retry_at(2, now).unwrap();
        assert_eq!((at - now).num_milliseconds(), 200);
    }
}
