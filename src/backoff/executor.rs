//! Backoff executor
//!
//! Retries transient failures with multiplicative, clamped delay.
//! Non-retryable errors propagate immediately without consuming attempts.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::{AutomationError, Result};

/// Backoff configuration.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackoffConfig {
    /// Total attempts, including the first (minimum 1)
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Upper bound on any single delay
    pub max_delay: Duration,
    /// Multiplier applied to the delay after each retry
    pub backoff_factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
        }
    }
}

/// Run `op` with bounded retries.
///
/// The first attempt runs immediately. A non-retryable failure is re-raised
/// as-is with no delay. A retryable failure on the final attempt is wrapped
/// in a "failed after N attempts" error that preserves the original kind and
/// recoverability. Between attempts the delay grows by `backoff_factor`,
/// clamped to `max_delay`.
pub async fn execute_with_backoff<T, F, Fut>(
    config: &BackoffConfig,
    label: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut delay = config.initial_delay;
    let mut attempt: u32 = 1;

    loop {
        match op().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!("{} succeeded on attempt {}/{}", label, attempt, max_attempts);
                }
                return Ok(value);
            }
            Err(err) if !err.is_retryable() => {
                warn!("{} failed with non-retryable error: {}", label, err);
                return Err(err);
            }
            Err(err) if attempt >= max_attempts => {
                warn!(
                    "{} exhausted retries: {} (attempts: {})",
                    label, err, max_attempts
                );
                return Err(AutomationError {
                    kind: err.kind,
                    message: format!(
                        "{} failed after {} attempts: {}",
                        label, max_attempts, err.message
                    ),
                    recoverable: err.recoverable,
                });
            }
            Err(err) => {
                debug!(
                    "{} attempt {}/{} failed ({}), retrying in {}ms",
                    label,
                    attempt,
                    max_attempts,
                    err,
                    delay.as_millis()
                );
                sleep(delay).await;
                delay = delay.mul_f64(config.backoff_factor).min(config.max_delay);
                attempt += 1;
            }
        }
    }
}
