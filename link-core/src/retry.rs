//! Retry policy for transport writes.
//!
//! Exponential backoff with random jitter so that many devices coming back
//! online at the same time do not hammer the backend in lockstep.
//!
//! Formula: min(max_delay, base * 2^(attempt-1)) + random(0..=jitter)

use std::time::Duration;

/// When and how often to retry a failed transient operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Ceiling for the exponential part.
    pub max_delay: Duration,
    /// Upper bound of the random jitter added on top.
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            jitter: Duration::from_millis(250),
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Policy with the given attempt count and no waiting (tests, demos).
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: Duration::ZERO,
        }
    }

    /// Whether another attempt is allowed after `attempt` failures.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Delay before retry number `attempt` (1-based), jitter included.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay_for(attempt) + random_jitter(self.jitter)
    }

    /// Delay without jitter.
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let factor = 1u32 << shift;
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

fn random_jitter(max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    let mut bytes = [0u8; 8];
    getrandom::getrandom(&mut bytes).expect("getrandom failed");
    Duration::from_millis(u64::from_le_bytes(bytes) % (max_ms + 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_until_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(700),
            jitter: Duration::ZERO,
        };
        assert_eq!(policy.base_delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.base_delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.base_delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.base_delay_for(4), Duration::from_millis(700));
        assert_eq!(policy.base_delay_for(40), Duration::from_millis(700));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = RetryPolicy::default();
        for attempt in 1..5 {
            let delay = policy.delay(attempt);
            let base = policy.base_delay_for(attempt);
            assert!(delay >= base);
            assert!(delay <= base + policy.jitter);
        }
    }

    #[test]
    fn jitter_creates_variance() {
        let policy = RetryPolicy {
            jitter: Duration::from_secs(5),
            ..RetryPolicy::default()
        };
        let delays: Vec<_> = (0..20).map(|_| policy.delay(1)).collect();
        let min = delays.iter().min().unwrap();
        let max = delays.iter().max().unwrap();
        assert!(max > min, "expected jitter variance");
    }

    #[test]
    fn attempt_budget() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(!RetryPolicy::none().should_retry(1));
    }

    #[test]
    fn immediate_policy_never_waits() {
        let policy = RetryPolicy::immediate(4);
        assert_eq!(policy.delay(3), Duration::ZERO);
        assert!(policy.should_retry(3));
    }
}
