//! Retry utilities for resilient operations
//!
//! This module provides a common retry mechanism with exponential backoff
//! used by every component that talks to the coordination store.

use std::future::Future;
use rand::Rng;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{Error, Result, ShoalErrorTrait};

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts
    pub max_retries: u32,

    /// Base delay in milliseconds for exponential backoff
    pub base_delay_ms: u64,

    /// Maximum delay in milliseconds (caps exponential growth)
    pub max_delay_ms: u64,

    /// Multiplier for exponential backoff (default: 2.0)
    pub backoff_multiplier: f64,

    /// Randomize each delay to between half and all of its computed value
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }
}

impl RetryConfig {
    /// Create a new retry configuration with custom max retries
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    /// Create a retry configuration with custom delays
    pub fn with_delays(max_retries: u32, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            max_retries,
            base_delay_ms,
            max_delay_ms,
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }

    /// Spread retries of many processes hitting the same outage
    #[must_use]
    pub fn with_jitter(mut self) -> Self {
        self.jitter = true;
        self
    }

    /// Retry until the operation succeeds or fails with a non-retryable error
    pub fn forever(base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self::with_delays(u32::MAX, base_delay_ms, max_delay_ms)
    }

    /// Calculate delay for a given attempt using exponential backoff
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let delay_ms = if attempt == 0 {
            0
        } else {
            let exponent = (attempt - 1).min(32) as i32;
            let exponential = self.base_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
            if exponential >= self.max_delay_ms as f64 {
                self.max_delay_ms
            } else {
                exponential as u64
            }
        };

        Duration::from_millis(delay_ms)
    }

    /// Delay to actually sleep before `attempt`
    pub fn sleep_delay(&self, attempt: u32) -> Duration {
        let delay = self.calculate_delay(attempt);
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        delay.mul_f64(rand::thread_rng().gen_range(0.5..=1.0))
    }
}

/// Execute an operation with retry logic and exponential backoff
///
/// Only errors reporting [`ShoalErrorTrait::is_recoverable`] are retried.
///
/// # Example
///
/// ```no_run
/// use shoal::utils::retry::{with_retry, RetryConfig};
/// use shoal::error::Result;
///
/// async fn fetch_data() -> Result<String> {
///     Ok("data".to_string())
/// }
///
/// #[tokio::main]
/// async fn main() -> Result<()> {
///     let config = RetryConfig::default();
///     let result = with_retry(&config, || async {
///         fetch_data().await
///     }).await?;
///     Ok(())
/// }
/// ```
pub async fn with_retry<T, F, Fut>(config: &RetryConfig, operation: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    with_retry_if(config, operation, |e: &Error| e.is_recoverable()).await
}

/// Execute an operation with retry logic, using a custom retry predicate
///
/// Returns `Ok(T)` on success, or the last error if all retries fail or the
/// predicate rejects an error.
pub async fn with_retry_if<T, F, Fut, P>(
    config: &RetryConfig,
    operation: F,
    should_retry: P,
) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
    P: Fn(&Error) -> bool,
{
    let mut last_error = None;
    let mut attempt: u32 = 0;

    loop {
        // Apply exponential backoff for retries
        if attempt > 0 {
            let delay = config.sleep_delay(attempt);
            debug!(
                attempt = attempt,
                delay_ms = delay.as_millis(),
                "Retrying operation after delay"
            );
            tokio::time::sleep(delay).await;
        }

        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    debug!(attempt = attempt, "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) => {
                if !should_retry(&e) {
                    debug!(error = %e, "Non-retryable error encountered");
                    return Err(e);
                }

                warn!(
                    attempt = attempt,
                    max_retries = config.max_retries,
                    error = %e,
                    "Operation failed, will retry"
                );
                last_error = Some(e);
            }
        }

        if attempt >= config.max_retries {
            break;
        }
        attempt += 1;
    }

    // All retries exhausted
    Err(last_error.unwrap_or_else(|| Error::other("Operation failed with no error details")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_retry_success_first_attempt() {
        let config = RetryConfig::new(3);
        let result = with_retry(&config, || async { Ok::<_, Error>(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_retry_success_after_failures() {
        let config = RetryConfig::with_delays(3, 1, 5);
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = Arc::clone(&attempts);

        let result = with_retry(&config, move || {
            let attempts = Arc::clone(&attempts_clone);
            async move {
                let count = attempts.fetch_add(1, Ordering::SeqCst);
                if count < 2 {
                    return Err(Error::connection_lost("simulated"));
                }
                Ok(42)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_exhausted() {
        let config = RetryConfig::with_delays(2, 1, 5);
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = Arc::clone(&attempts);

        let result: Result<()> = with_retry(&config, move || {
            attempts_clone.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::connection_lost("permanent")) }
        })
        .await;

        assert!(result.unwrap_err().is_connection_lost());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_recoverable_not_retried() {
        let config = RetryConfig::with_delays(3, 1, 5);
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = Arc::clone(&attempts);

        let result: Result<()> = with_retry(&config, move || {
            attempts_clone.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::already_exists("/a")) }
        })
        .await;

        assert!(result.unwrap_err().is_already_exists());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_if_predicate() {
        let config = RetryConfig::with_delays(3, 1, 5);

        let result: Result<()> = with_retry_if(
            &config,
            || async { Err(Error::config("validation error")) },
            |e| !matches!(e, Error::Config(_)),
        )
        .await;

        assert!(result.unwrap_err().to_string().contains("validation"));
    }

    #[test]
    fn test_calculate_delay() {
        let config = RetryConfig::default();

        assert_eq!(config.calculate_delay(0), Duration::from_millis(0));
        assert_eq!(config.calculate_delay(1), Duration::from_millis(1000));
        assert_eq!(config.calculate_delay(2), Duration::from_millis(2000));
        assert_eq!(config.calculate_delay(3), Duration::from_millis(4000));
    }

    #[test]
    fn test_max_delay_cap() {
        let config = RetryConfig::with_delays(10, 1000, 5000);
        assert_eq!(config.calculate_delay(10), Duration::from_millis(5000));

        let forever = RetryConfig::forever(100, 2000);
        assert_eq!(forever.calculate_delay(u32::MAX), Duration::from_millis(2000));
    }

    #[test]
    fn test_jitter_bounds() {
        let config = RetryConfig::with_delays(5, 1000, 8000).with_jitter();
        for attempt in 1..=5 {
            let full = config.calculate_delay(attempt);
            let delay = config.sleep_delay(attempt);
            assert!(delay <= full);
            assert!(delay >= full / 2);
        }
        assert_eq!(config.sleep_delay(0), Duration::ZERO);

        let plain = RetryConfig::with_delays(5, 1000, 8000);
        assert_eq!(plain.sleep_delay(3), plain.calculate_delay(3));
    }
}
