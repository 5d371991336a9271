//! Bounded retry for best-effort side effects (emails, outbound API calls).
//!
//! The primary operation has already committed when these run, so the final
//! failure is returned to the caller to log, never to propagate.

use backoff::ExponentialBackoffBuilder;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
    /// Upper bound on the whole retry loop.
    pub max_elapsed: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            max_elapsed: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    pub fn quick() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
            backoff_multiplier: 2.0,
            max_elapsed: Duration::from_secs(1),
        }
    }
}

/// Run `operation` with exponential backoff until it succeeds or the attempt
/// or time budget runs out.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let policy = ExponentialBackoffBuilder::new()
        .with_initial_interval(config.initial_backoff)
        .with_max_interval(config.max_backoff)
        .with_multiplier(config.backoff_multiplier)
        .with_max_elapsed_time(Some(config.max_elapsed))
        .build();

    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0u32;

    backoff::future::retry(policy, || {
        attempt += 1;
        let current = attempt;
        let fut = operation();
        async move {
            match fut.await {
                Ok(value) => {
                    if current > 1 {
                        info!(
                            operation = operation_name,
                            attempt = current,
                            "Call succeeded after retry"
                        );
                    }
                    Ok(value)
                }
                Err(err) if current >= max_attempts => {
                    warn!(
                        operation = operation_name,
                        attempt = current,
                        error = %err,
                        "Call failed after max attempts"
                    );
                    Err(backoff::Error::permanent(err))
                }
                Err(err) => {
                    warn!(
                        operation = operation_name,
                        attempt = current,
                        error = %err,
                        "Call failed, retrying"
                    );
                    Err(backoff::Error::transient(err))
                }
            }
        }
    })
    .await
}
