//! Bounded retry for whole pipeline steps
//!
//! Orchestrated flows wrap each externally fallible step ("create pipeline
//! instance", "dbt run", ...) in [`retry`]. The wrapped operation must be safe
//! to re-run from scratch; nothing here tries to resume partial work.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How the delay grows between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backoff {
    #[default]
    Fixed,
    /// `delay * 2^(attempt - 1)`
    Exponential,
}

/// Attempt budget and delay schedule for one step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one; values below 1 behave as 1
    pub max_attempts: u32,
    pub delay: Duration,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    /// Single attempt, no retry
    fn default() -> Self {
        Self::fixed(1, Duration::ZERO)
    }
}

impl RetryPolicy {
    pub const fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
            backoff: Backoff::Fixed,
        }
    }

    pub const fn exponential(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            delay: base_delay,
            backoff: Backoff::Exponential,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay to wait after the given failed attempt (1-based)
    pub fn delay_after(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.delay,
            Backoff::Exponential => {
                let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
                self.delay.saturating_mul(factor)
            },
        }
    }
}

/// Run `operation` until it succeeds or the policy's attempts are used up
///
/// The last error is returned unchanged so callers can still match on it.
pub async fn retry<T, E, F, Fut>(policy: &RetryPolicy, step: &str, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let attempts = policy.attempts();
    let mut attempt = 1;

    loop {
        debug!(step, attempt, attempts, "Starting attempt");

        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    info!(step, attempt, "Step succeeded after retry");
                }
                return Ok(value);
            },
            Err(e) if attempt < attempts => {
                let delay = policy.delay_after(attempt);
                warn!(
                    step,
                    attempt,
                    attempts,
                    error = %e,
                    "Attempt failed, retrying in {:?}",
                    delay
                );
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                attempt += 1;
            },
            Err(e) => {
                warn!(step, attempts, error = %e, "Step failed, no attempts left");
                return Err(e);
            },
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_fixed_delay_is_constant() {
        let policy = RetryPolicy::fixed(3, Duration::from_secs(30));
        assert_eq!(policy.attempts(), 3);
        assert_eq!(policy.delay_after(1), Duration::from_secs(30));
        assert_eq!(policy.delay_after(2), Duration::from_secs(30));
    }

    #[test]
    fn test_exponential_delay_doubles() {
        let policy = RetryPolicy::exponential(4, Duration::from_secs(2));
        assert_eq!(policy.delay_after(1), Duration::from_secs(2));
        assert_eq!(policy.delay_after(2), Duration::from_secs(4));
        assert_eq!(policy.delay_after(3), Duration::from_secs(8));
    }

    #[test]
    fn test_zero_attempts_behaves_as_one() {
        let policy = RetryPolicy::fixed(0, Duration::ZERO);
        assert_eq!(policy.attempts(), 1);
        assert_eq!(RetryPolicy::default().attempts(), 1);
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_failures() {
        let calls = &AtomicU32::new(0);
        let policy = RetryPolicy::fixed(3, Duration::ZERO);

        let result: Result<u32, String> = retry(&policy, "flaky", move || async move {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n < 3 {
                Err(format!("attempt {} failed", n))
            } else {
                Ok(n)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_returns_last_error() {
        let calls = &AtomicU32::new(0);
        let policy = RetryPolicy::fixed(2, Duration::ZERO);

        let result: Result<(), String> = retry(&policy, "broken", move || async move {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            Err(format!("failure {}", n))
        })
        .await;

        assert_eq!(result.unwrap_err(), "failure 2");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_waits_between_attempts() {
        let policy = RetryPolicy::fixed(2, Duration::from_secs(60));
        let started = tokio::time::Instant::now();
        let calls = &AtomicU32::new(0);

        let _: Result<(), &str> = retry(&policy, "slow", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err("nope")
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(started.elapsed() >= Duration::from_secs(60));
    }
}
