//! Bounded retry with exponential backoff
//!
//! Only [`SyncError::is_transient`] errors are retried; everything else is
//! returned to the caller on the first attempt.

use std::future::Future;
use std::time::Duration;

use tracing::{info, warn};

use crate::SyncError;

/// Retry parameters
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry; doubled on every further retry
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    /// Delay before retry number `attempt` (0-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(attempt))
    }
}

/// Executes an async operation with exponential backoff retry
///
/// Backoff schedule with a 1s base: 1s, 2s, 4s, ...
pub async fn with_retry<F, Fut, T>(
    operation_name: &str,
    policy: RetryPolicy,
    mut f: F,
) -> Result<T, SyncError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SyncError>>,
{
    let mut attempt = 0;
    loop {
        match f().await {
            Ok(value) => {
                if attempt > 0 {
                    info!(
                        operation = operation_name,
                        attempt, "Operation succeeded after retry"
                    );
                }
                return Ok(value);
            }
            Err(err) if attempt < policy.max_retries && err.is_transient() => {
                let delay = policy.delay_for(attempt);
                warn!(
                    operation = operation_name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Transient error, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
