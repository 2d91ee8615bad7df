use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, warn};

use crate::config::{BackoffStrategy, ClientConfig};
use crate::error::{Result, SftpError};

/// Bounded retry with fixed or exponential backoff
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt (0 = exactly one attempt)
    pub max_retries: u32,
    /// Base delay between attempts
    pub retry_delay: Duration,
    pub backoff: BackoffStrategy,
    /// Upper bound for any single delay
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            backoff: BackoffStrategy::Exponential,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            retry_delay: config.retry_delay(),
            backoff: config.backoff,
            max_delay: config.max_retry_delay(),
        }
    }

    /// A policy that makes exactly one attempt
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Delay before retry number `retry` (0-indexed).
    ///
    /// Exponential backoff doubles the base delay per retry and saturates at
    /// `max_delay`; fixed backoff always returns the base delay.
    #[must_use]
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        match self.backoff {
            BackoffStrategy::Fixed => self.retry_delay,
            BackoffStrategy::Exponential => {
                let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
                self.retry_delay.saturating_mul(factor).min(self.max_delay)
            }
        }
    }

    /// Run `operation` with the default classifier, [`SftpError::is_retryable`].
    ///
    /// # Errors
    ///
    /// See [`RetryPolicy::execute`].
    pub async fn run<T, F, Fut>(&self, operation_name: &str, operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.execute(operation_name, operation, SftpError::is_retryable)
            .await
    }

    /// Run `operation`, retrying failures that `classifier` accepts.
    ///
    /// # Errors
    ///
    /// A rejected error is returned unchanged on first occurrence. When the
    /// retry budget runs out the last error is returned wrapped in
    /// [`SftpError::RetriesExhausted`]. If some attempts failed for
    /// non-connection reasons, a connection-level last error is recast as
    /// `FileTransfer` so the result reports a connection kind only when every
    /// attempt failed at the connection level.
    pub async fn execute<T, F, Fut, C>(
        &self,
        operation_name: &str,
        mut operation: F,
        classifier: C,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
        C: Fn(&SftpError) -> bool,
    {
        let max_attempts = self.max_retries.saturating_add(1);
        let mut attempt: u32 = 0;
        let mut all_connection_level = true;

        loop {
            attempt += 1;

            let error = match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(
                            operation = %operation_name,
                            attempt,
                            "Operation succeeded after retry"
                        );
                    }
                    return Ok(value);
                }
                Err(e) => e,
            };

            if !classifier(&error) {
                debug!(
                    operation = %operation_name,
                    attempt,
                    error = %error,
                    "Operation failed, not retryable"
                );
                return Err(error);
            }

            all_connection_level &= error.is_connection_level();

            if attempt >= max_attempts {
                warn!(
                    operation = %operation_name,
                    attempts = attempt,
                    error = %error,
                    "Operation failed, retries exhausted"
                );
                let source = if !all_connection_level && error.is_connection_level() {
                    SftpError::FileTransfer {
                        reason: error.to_string(),
                    }
                } else {
                    error
                };
                return Err(SftpError::RetriesExhausted {
                    attempts: attempt,
                    source: Box::new(source),
                });
            }

            let delay = self.delay_for_retry(attempt - 1);
            warn!(
                operation = %operation_name,
                attempt,
                max_attempts,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %error,
                "Operation failed, will retry"
            );
            sleep(delay).await;
        }
    }
}
