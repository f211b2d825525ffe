//! Backoff and retry
//!
//! Two consumers share one backoff curve:
//! - the reconcile error policy, which turns a failure count into a requeue delay
//! - [`with_retry`], used for short in-process retries such as status writes
//!   that lose an optimistic-concurrency race

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

fn default_initial_ms() -> u64 {
    1_000
}

fn default_max_secs() -> u64 {
    300
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_true() -> bool {
    true
}

/// Exponential backoff curve
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackoffConfig {
    /// Delay after the first failure
    #[serde(default = "default_initial_ms")]
    pub initial_ms: u64,

    /// Ceiling; delays stay here once reached
    #[serde(default = "default_max_secs")]
    pub max_secs: u64,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Add 0-25% random jitter to spread retries
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: default_initial_ms(),
            max_secs: default_max_secs(),
            multiplier: default_multiplier(),
            jitter: true,
        }
    }
}

impl BackoffConfig {
    /// Short curve for in-process retries
    pub fn quick() -> Self {
        Self {
            initial_ms: 50,
            max_secs: 2,
            multiplier: 2.0,
            jitter: true,
        }
    }

    pub fn initial(&self) -> Duration {
        Duration::from_millis(self.initial_ms)
    }

    pub fn ceiling(&self) -> Duration {
        Duration::from_secs(self.max_secs)
    }

    /// Delay for the given zero-based attempt
    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_capped(attempt, self.ceiling())
    }

    /// Delay for the given attempt, capped at `ceiling` instead of the configured maximum
    ///
    /// Jitter is applied before the cap, so the result never exceeds `ceiling`.
    pub fn delay_capped(&self, attempt: u32, ceiling: Duration) -> Duration {
        let base = self.base_secs(attempt);

        let with_jitter = if self.jitter {
            base * (1.0 + rand_jitter() * 0.25)
        } else {
            base
        };

        Duration::from_secs_f64(with_jitter.min(ceiling.as_secs_f64()))
    }

    /// Whether the un-jittered curve has reached the ceiling at `attempt`
    pub fn reaches_ceiling(&self, attempt: u32) -> bool {
        self.base_secs(attempt) >= self.ceiling().as_secs_f64()
    }

    fn base_secs(&self, attempt: u32) -> f64 {
        let exponent = attempt.min(64) as i32;
        self.initial().as_secs_f64() * self.multiplier.powi(exponent)
    }
}

/// Simple pseudo-random jitter (0.0 to 1.0) without external dependency
fn rand_jitter() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    (nanos % 1000) as f64 / 1000.0
}

/// Retry classification for errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry the operation
    Retry,
    /// Retry after a specific duration (e.g., from a Retry-After header)
    RetryAfter(Duration),
    /// Don't retry, the error is permanent
    NoRetry,
}

/// Trait for errors that can indicate whether to retry
pub trait RetryableError {
    fn retry_decision(&self) -> RetryDecision;
}

/// Execute an async operation, retrying up to `max_retries` times
///
/// Returns the result of the operation, or the last error once retries are
/// exhausted or the error is not retryable.
pub async fn with_retry<F, Fut, T, E>(
    backoff: &BackoffConfig,
    max_retries: u32,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: RetryableError + std::fmt::Display,
{
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                let decision = e.retry_decision();
                if decision == RetryDecision::NoRetry {
                    debug!(
                        operation = operation_name,
                        attempt = attempt,
                        "Operation failed with non-retryable error: {}",
                        e
                    );
                    return Err(e);
                }
                if attempt >= max_retries {
                    warn!(
                        operation = operation_name,
                        attempts = attempt + 1,
                        "Operation failed after {} attempts: {}",
                        attempt + 1,
                        e
                    );
                    return Err(e);
                }

                let delay = match decision {
                    RetryDecision::RetryAfter(d) => d.min(backoff.ceiling()),
                    _ => backoff.delay(attempt),
                };

                debug!(
                    operation = operation_name,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying after error: {}",
                    e
                );

                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> BackoffConfig {
        BackoffConfig {
            initial_ms: 1_000,
            max_secs: 60,
            multiplier: 2.0,
            jitter: false,
        }
    }

    #[test]
    fn test_delay_doubles_until_ceiling() {
        let config = no_jitter();

        assert_eq!(config.delay(0), Duration::from_secs(1));
        assert_eq!(config.delay(1), Duration::from_secs(2));
        assert_eq!(config.delay(3), Duration::from_secs(8));
        assert_eq!(config.delay(6), Duration::from_secs(60));
        assert_eq!(config.delay(40), Duration::from_secs(60));
    }

    #[test]
    fn test_delay_capped_uses_custom_ceiling() {
        let config = no_jitter();
        assert_eq!(
            config.delay_capped(10, Duration::from_secs(5)),
            Duration::from_secs(5)
        );
    }

    #[test]
    fn test_delay_with_jitter_stays_in_band() {
        let config = BackoffConfig {
            jitter: true,
            ..no_jitter()
        };
        let delay = config.delay(0);
        assert!(delay >= Duration::from_secs(1));
        assert!(delay <= Duration::from_millis(1250));
    }

    #[test]
    fn test_jittered_delay_never_exceeds_ceiling() {
        let config = BackoffConfig::default();
        for attempt in [8, 9, 30] {
            for _ in 0..200 {
                assert!(config.delay(attempt) <= config.ceiling());
                assert!(config.delay_capped(attempt, Duration::from_secs(120)) <= Duration::from_secs(120));
            }
        }
        assert_eq!(config.delay(30), config.ceiling());
    }

    #[test]
    fn test_reaches_ceiling() {
        let config = no_jitter();
        assert!(!config.reaches_ceiling(0));
        assert!(!config.reaches_ceiling(5));
        assert!(config.reaches_ceiling(6));
        assert!(config.reaches_ceiling(40));
    }

    #[derive(Debug)]
    struct TestError {
        retryable: bool,
    }

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "TestError(retryable={})", self.retryable)
        }
    }

    impl RetryableError for TestError {
        fn retry_decision(&self) -> RetryDecision {
            if self.retryable {
                RetryDecision::Retry
            } else {
                RetryDecision::NoRetry
            }
        }
    }

    #[tokio::test]
    async fn test_retry_succeeds_eventually() {
        let mut attempts = 0;

        let result: Result<&str, TestError> =
            with_retry(&BackoffConfig::quick(), 3, "test", || {
                attempts += 1;
                async move {
                    if attempts < 3 {
                        Err(TestError { retryable: true })
                    } else {
                        Ok("success")
                    }
                }
            })
            .await;

        assert!(result.is_ok());
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up() {
        let mut attempts = 0;

        let result: Result<&str, TestError> =
            with_retry(&BackoffConfig::quick(), 2, "test", || {
                attempts += 1;
                async move { Err(TestError { retryable: true }) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn test_no_retry_on_permanent_error() {
        let mut attempts = 0;

        let result: Result<&str, TestError> =
            with_retry(&BackoffConfig::quick(), 3, "test", || {
                attempts += 1;
                async move { Err(TestError { retryable: false }) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempts, 1);
    }
}
