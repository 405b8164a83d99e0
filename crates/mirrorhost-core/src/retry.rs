//! Retry with exponential backoff.
//!
//! Every mutating task-store operation goes through [`with_contention_retry`]:
//! SQLite is a single-writer database shared by the request path and the
//! replay ticks, so `SQLITE_BUSY`/`SQLITE_LOCKED` failures are expected and
//! retried here instead of at each call site.
//!
//! # Usage
//!
//! ```rust,ignore
//! use mirrorhost_core::retry::{RetryPolicy, with_contention_retry};
//!
//! let policy = RetryPolicy::storage_commit();
//! let task = with_contention_retry(&policy, || async {
//!     store_operation().await
//! }).await?;
//! ```
//!
//! # Delay schedule
//!
//! Attempt `i` (0-indexed) waits `min(d * factor^i, max_delay)` plus a
//! non-negative jitter drawn from `[0, jitter_percent * d]`, where `d` is
//! the initial delay.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Configuration for retry behavior with exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Initial delay before first retry (default: 100ms).
    pub initial_delay: Duration,
    /// Maximum delay between retries, before jitter (default: 5s).
    pub max_delay: Duration,
    /// Multiplier applied to delay after each retry (default: 2.0).
    pub backoff_factor: f64,
    /// Upper bound of the added jitter as a fraction of `initial_delay` (default: 0.1).
    pub jitter_percent: f64,
    /// Maximum number of attempts. None = retry forever (use with caution).
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::storage_commit()
    }
}

impl RetryPolicy {
    /// Create a new retry policy with the specified parameters.
    #[must_use]
    pub fn new(
        initial_delay: Duration,
        max_delay: Duration,
        backoff_factor: f64,
        jitter_percent: f64,
        max_attempts: Option<u32>,
    ) -> Self {
        Self {
            initial_delay,
            max_delay,
            backoff_factor: backoff_factor.max(1.0),
            jitter_percent: jitter_percent.clamp(0.0, 1.0),
            max_attempts,
        }
    }

    /// Policy for task-store commits: 5 attempts, 100ms initial.
    #[must_use]
    pub fn storage_commit() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            backoff_factor: 2.0,
            jitter_percent: 0.1,
            max_attempts: Some(5),
        }
    }

    /// Same schedule without jitter, for deterministic tests.
    #[must_use]
    pub fn without_jitter(mut self) -> Self {
        self.jitter_percent = 0.0;
        self
    }

    /// Un-jittered delay for a given attempt number (0-indexed).
    #[must_use]
    pub fn base_delay_for_attempt(&self, attempt: u32) -> Duration {
        let initial_ms = u64::try_from(self.initial_delay.as_millis()).unwrap_or(u64::MAX);
        let max_ms = u64::try_from(self.max_delay.as_millis()).unwrap_or(u64::MAX);

        // Cap exponent to prevent overflow in powi
        let exp = attempt.min(31) as i32;
        let base_ms = (initial_ms as f64) * self.backoff_factor.powi(exp);
        Duration::from_millis(base_ms.min(max_ms as f64).max(0.0) as u64)
    }

    /// Delay for a given attempt number (0-indexed), jitter included.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay_for_attempt(attempt);
        let jitter_ceiling_ms = self.initial_delay.as_millis() as f64 * self.jitter_percent;
        if jitter_ceiling_ms <= 0.0 {
            return base;
        }
        let jitter_ms = rand::rng().random_range(0.0..=jitter_ceiling_ms);
        base + Duration::from_millis(jitter_ms as u64)
    }
}

/// Outcome of a retry operation.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    /// The result (success or final error).
    pub result: Result<T>,
    /// Number of attempts made.
    pub attempts: u32,
    /// Total time spent (including delays).
    pub elapsed: Duration,
    /// Sum of the backoff delays slept between attempts.
    pub total_delay: Duration,
}

/// Execute an async operation retrying only storage contention.
///
/// Any other error is surfaced immediately. Contention that outlives the
/// policy's attempts is surfaced as the last `StorageError::Busy`.
pub async fn with_contention_retry<T, F, Fut>(policy: &RetryPolicy, operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    with_retry_outcome(policy, Error::is_contention, operation)
        .await
        .result
}

/// Execute an async operation with retry, returning detailed outcome.
///
/// `should_retry` decides which errors are worth another attempt.
/// Sleeps use `tokio::time`, so a paused test clock advances through the
/// backoff without real waiting.
pub async fn with_retry_outcome<T, F, Fut, P>(
    policy: &RetryPolicy,
    should_retry: P,
    mut operation: F,
) -> RetryOutcome<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    P: Fn(&Error) -> bool,
{
    let start = tokio::time::Instant::now();
    let mut attempt = 0u32;
    let mut total_delay = Duration::ZERO;

    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(
                        total_attempts = attempt + 1,
                        retries = attempt,
                        "Operation succeeded after retries"
                    );
                }
                return RetryOutcome {
                    result: Ok(value),
                    attempts: attempt + 1,
                    elapsed: start.elapsed(),
                    total_delay,
                };
            }
            Err(e) => {
                attempt += 1;

                if !should_retry(&e) {
                    debug!(attempt, error = %e, "Non-retryable error, giving up");
                    return RetryOutcome {
                        result: Err(e),
                        attempts: attempt,
                        elapsed: start.elapsed(),
                        total_delay,
                    };
                }

                if let Some(max) = policy.max_attempts {
                    if attempt >= max {
                        warn!(
                            attempt,
                            max_attempts = max,
                            error = %e,
                            elapsed_ms = start.elapsed().as_millis() as u64,
                            "Operation failed after all retry attempts"
                        );
                        return RetryOutcome {
                            result: Err(e),
                            attempts: attempt,
                            elapsed: start.elapsed(),
                            total_delay,
                        };
                    }
                }

                let delay = policy.delay_for_attempt(attempt - 1);
                debug!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Retrying operation after failure"
                );

                total_delay += delay;
                tokio::time::sleep(delay).await;
            }
        }
    }
}
