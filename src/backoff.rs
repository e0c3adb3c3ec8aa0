//! Bounded exponential backoff for readiness checks and session connects.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Exponential backoff with configurable min/max.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExponentialBackoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl ExponentialBackoff {
    /// Creates a new backoff starting at `initial`, capping at `max`.
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Returns the current backoff duration.
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Advances to the next backoff interval (doubles, capped at max).
    pub fn next(&mut self) {
        self.current = (self.current * 2).min(self.max);
    }

    /// Resets backoff to initial value.
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// A retry budget: how many attempts, and how long to wait between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. Never less than 1.
    pub attempts: u32,
    /// Delay after the first failure.
    pub initial_delay: Duration,
    /// Upper bound for a single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 10,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with the given attempt count and delays.
    pub fn new(attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            initial_delay,
            max_delay,
        }
    }

    /// A policy that never waits, for tests.
    pub fn immediate(attempts: u32) -> Self {
        Self::new(attempts, Duration::ZERO, Duration::ZERO)
    }

    /// Runs `op` until it succeeds or the attempt budget is spent.
    ///
    /// Returns the last error when every attempt failed.
    pub async fn retry<T, E, F, Fut>(&self, mut op: F) -> std::result::Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut backoff = ExponentialBackoff::new(self.initial_delay, self.max_delay);
        let attempts = self.attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if attempt >= attempts => return Err(e),
                Err(e) => {
                    tracing::debug!(attempt, attempts, error = %e, "attempt failed, backing off");
                    if !backoff.current().is_zero() {
                        tokio::time::sleep(backoff.current()).await;
                    }
                    backoff.next();
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn backoff_doubles_and_caps() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_millis(250), Duration::from_secs(1));
        backoff.next();
        assert_eq!(backoff.current(), Duration::from_millis(500));
        backoff.next();
        backoff.next();
        assert_eq!(backoff.current(), Duration::from_secs(1));
        backoff.reset();
        assert_eq!(backoff.current(), Duration::from_millis(250));
    }

    #[test]
    fn policy_never_has_zero_attempts() {
        let policy = RetryPolicy::new(0, Duration::ZERO, Duration::ZERO);
        assert_eq!(policy.attempts, 1);
    }

    #[tokio::test]
    async fn retry_returns_first_success() {
        let policy = RetryPolicy::immediate(5);
        let result: Result<u32, String> = policy
            .retry(|attempt| async move {
                if attempt < 3 {
                    Err(format!("attempt {} failed", attempt))
                } else {
                    Ok(attempt)
                }
            })
            .await;
        assert_eq!(result, Ok(3));
    }

    #[tokio::test]
    async fn retry_gives_up_after_budget() {
        let policy = RetryPolicy::immediate(3);
        let mut calls = 0;
        let result: Result<(), String> = policy
            .retry(|attempt| {
                calls += 1;
                async move { Err(format!("attempt {} failed", attempt)) }
            })
            .await;
        assert_eq!(result, Err("attempt 3 failed".to_string()));
        assert_eq!(calls, 3);
    }
}
