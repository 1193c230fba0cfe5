//! Exponential backoff for sink emission and reconnects.

use rand::Rng;
use std::time::Duration;

#[derive(Debug, Copy, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    /// Caps exponential growth.
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Randomize each delay by up to ±30%.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn backoff(&self) -> Backoff {
        Backoff::new(*self)
    }
}

#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    current_delay: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            current_delay: policy.initial_delay,
            attempt: 0,
        }
    }

    /// Returns the delay before the next attempt and grows the following one.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current_delay;
        let next_nanos = (delay.as_nanos() as f64 * self.policy.multiplier.max(1.0)) as u64;
        self.current_delay = Duration::from_nanos(next_nanos).min(self.policy.max_delay);
        self.attempt += 1;

        if self.policy.jitter {
            let factor = rand::rng().random_range(0.7..=1.3);
            delay.mul_f64(factor)
        } else {
            delay
        }
    }

    pub fn reset(&mut self) {
        self.current_delay = self.policy.initial_delay;
        self.attempt = 0;
    }

    /// Number of delays handed out since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(jitter: bool) -> RetryPolicy {
        RetryPolicy {
            max_attempts: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            multiplier: 2.0,
            jitter,
        }
    }

    #[test]
    fn test_delays_grow_and_cap() {
        let mut backoff = policy(false).backoff();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(), Duration::from_millis(350));
        assert_eq!(backoff.next_delay(), Duration::from_millis(350));
        assert_eq!(backoff.attempt(), 4);

        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let mut backoff = policy(true).backoff();
        for _ in 0..50 {
            backoff.reset();
            let delay = backoff.next_delay();
            assert!(delay >= Duration::from_millis(69), "{delay:?}");
            assert!(delay <= Duration::from_millis(131), "{delay:?}");
        }
    }
}
