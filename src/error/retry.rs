use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tracing::{debug, error, warn};

use crate::error::AppError;

/// Configuration for exponential backoff retry logic.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first one.
    pub max_attempts: u32,
    /// Base delay for exponential backoff in milliseconds.
    pub base_delay_ms: u64,
    /// Maximum delay cap in milliseconds.
    pub max_delay_ms: u64,
    /// Jitter factor to prevent thundering herd (0.0 to 1.0).
    pub jitter_factor: f64,
    /// Exponential backoff multiplier.
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 5000,
            jitter_factor: 0.1,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    /// Session acquisition: `base * 2^k`, capped at 5s.
    pub fn for_acquire(attempts: u32, backoff_base: Duration) -> Self {
        Self {
            max_attempts: attempts.max(1),
            base_delay_ms: backoff_base.as_millis() as u64,
            max_delay_ms: 5000,
            jitter_factor: 0.1,
            backoff_multiplier: 2.0,
        }
    }
}

/// Determines whether an error is worth retrying.
///
/// Only transient connectivity failures qualify. `ShuttingDown` is terminal,
/// `InvalidRequest` and `Cancelled` must surface immediately, and `QueryFailed`
/// is never re-run against the database with identical inputs.
pub fn is_retryable_error(error: &AppError) -> bool {
    match error {
        AppError::ConnectFailed(_) | AppError::Timeout(_) => true,
        AppError::UpstreamUnavailable(_) => true,
        AppError::InvalidRequest(_)
        | AppError::Cancelled(_)
        | AppError::ShuttingDown
        | AppError::QueryFailed(_)
        | AppError::PoolExhausted(_)
        | AppError::Internal(_) => false,
    }
}

/// Delay before attempt `attempt + 1`, with exponential backoff and jitter.
fn calculate_delay(attempt: u32, config: &RetryConfig) -> Duration {
    let exponential_delay =
        config.base_delay_ms as f64 * config.backoff_multiplier.powi(attempt as i32);
    let capped_delay = exponential_delay.min(config.max_delay_ms as f64);

    let mut rng = rand::thread_rng();
    let jitter_range = capped_delay * config.jitter_factor;
    let jitter = if jitter_range > 0.0 {
        rng.gen_range(-jitter_range..=jitter_range)
    } else {
        0.0
    };
    let final_delay = (capped_delay + jitter).max(0.0) as u64;

    Duration::from_millis(final_delay)
}

/// Execute a fallible async operation with exponential backoff.
pub async fn with_retry<F, Fut, T>(
    operation_name: &str,
    config: RetryConfig,
    operation: F,
) -> Result<T, AppError>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, AppError>>,
{
    let mut last_error = None;

    for attempt in 0..config.max_attempts {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    debug!(
                        operation = operation_name,
                        attempt = attempt + 1,
                        "Operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(err) => {
                if !is_retryable_error(&err) {
                    warn!(
                        operation = operation_name,
                        attempt = attempt + 1,
                        error = %err,
                        "Operation failed with non-retryable error"
                    );
                    return Err(err);
                }

                if attempt == config.max_attempts - 1 {
                    error!(
                        operation = operation_name,
                        attempts = config.max_attempts,
                        error = %err,
                        "Operation failed after all retry attempts"
                    );
                    last_error = Some(err);
                    break;
                }

                let delay = calculate_delay(attempt, &config);
                warn!(
                    operation = operation_name,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Operation failed, retrying after delay"
                );
                last_error = Some(err);
                sleep(delay).await;
            }
        }
    }

    Err(last_error
        .unwrap_or_else(|| AppError::Internal("Retry loop ended without capturing error".into())))
}
