use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    Exponential,
    Fixed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub kind: BackoffKind,
    pub delay: Duration,
}

/// Bounded retry schedule applied to failed jobs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// total number of attempts, including the first delivery
    pub attempts: u32,
    pub backoff: Backoff,
}

/// What happened to a job after it was reported as failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    Retrying { attempt: u32, delay: Duration },
    DeadLettered,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::exponential(3, Duration::from_secs(1))
    }
}

impl RetryPolicy {
    pub fn exponential(attempts: u32, delay: Duration) -> RetryPolicy {
        RetryPolicy {
            attempts,
            backoff: Backoff {
                kind: BackoffKind::Exponential,
                delay,
            },
        }
    }

    pub fn fixed(attempts: u32, delay: Duration) -> RetryPolicy {
        RetryPolicy {
            attempts,
            backoff: Backoff {
                kind: BackoffKind::Fixed,
                delay,
            },
        }
    }

    /// Delay before the next attempt once `attempts_made` attempts have failed
    pub fn delay(&self, attempts_made: u32) -> Duration {
        match self.backoff.kind {
            BackoffKind::Fixed => self.backoff.delay,
            BackoffKind::Exponential => {
                let exponent = attempts_made.saturating_sub(1).min(31);
                self.backoff.delay.saturating_mul(1u32 << exponent)
            }
        }
    }

    pub fn next(&self, attempts_made: u32) -> FailOutcome {
        if attempts_made >= self.attempts {
            return FailOutcome::DeadLettered;
        }
        FailOutcome::Retrying {
            attempt: attempts_made + 1,
            delay: self.delay(attempts_made),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_delay_doubles() {
        let policy = RetryPolicy::exponential(5, Duration::from_millis(1000));
        assert_eq!(policy.delay(1), Duration::from_millis(1000));
        assert_eq!(policy.delay(2), Duration::from_millis(2000));
        assert_eq!(policy.delay(3), Duration::from_millis(4000));
    }

    #[test]
    fn fixed_delay_is_constant() {
        let policy = RetryPolicy::fixed(5, Duration::from_millis(250));
        assert_eq!(policy.delay(1), policy.delay(4));
    }

    #[test]
    fn retries_until_attempts_are_exhausted() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.next(1),
            FailOutcome::Retrying {
                attempt: 2,
                delay: Duration::from_secs(1)
            }
        );
        assert_eq!(
            policy.next(2),
            FailOutcome::Retrying {
                attempt: 3,
                delay: Duration::from_secs(2)
            }
        );
        assert_eq!(policy.next(3), FailOutcome::DeadLettered);
    }

    #[test]
    fn huge_attempt_counts_saturate() {
        let policy = RetryPolicy::exponential(u32::MAX, Duration::from_secs(1));
        assert!(policy.delay(200) >= Duration::from_secs(1 << 31));
    }
}
