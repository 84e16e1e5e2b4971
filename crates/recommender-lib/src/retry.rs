//! Retry with exponential backoff for transient upstream failures
//!
//! Only `Transient` errors are retried; every other kind surfaces
//! immediately. The total time spent retrying is bounded so a throttled
//! provider can never stall an iteration past its interval.

use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::error::Result;

/// Backoff settings for one retried operation.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Multiplier applied to the delay after each attempt.
    pub backoff_multiplier: f64,
    /// Upper bound on the summed delays; the iteration interval in practice.
    pub max_total_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(250),
            backoff_multiplier: 2.0,
            max_total_delay: Duration::from_secs(60),
        }
    }
}

impl RetryConfig {
    /// Backoff bounded by one loop iteration.
    pub fn within_interval(interval: Duration) -> Self {
        Self {
            max_total_delay: interval,
            ..Default::default()
        }
    }
}

/// Runs `operation`, retrying transient failures with exponential backoff
/// until the total delay budget is spent.
pub async fn retry_transient<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = config.initial_delay;
    let mut slept = Duration::ZERO;

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(err) if err.is_retryable() && slept + delay <= config.max_total_delay => {
                warn!(
                    operation = %operation_name,
                    error = %err,
                    delay_ms = delay.as_millis() as u64,
                    "Transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
                slept += delay;
                delay = Duration::from_secs_f64(delay.as_secs_f64() * config.backoff_multiplier);
            }
            Err(err) => return Err(err),
        }
    }
}
