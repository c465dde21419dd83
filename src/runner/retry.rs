use std::future::Future;

use prometheus::Counter;
use tracing::warn;

use crate::config::RetryConfig;
use crate::error::EtlError;

/// Retries a task under the configured policy.
///
/// The backoff factor is 1: a fixed delay between attempts. Fatal kinds
/// (schema mismatch, deadline) abort immediately; only unavailability is
/// worth waiting out.
pub async fn retry_with_backoff<T, F, Fut>(
    task: &str,
    policy: RetryConfig,
    retries: Option<&Counter>,
    mut f: F,
) -> Result<T, EtlError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, EtlError>>,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 1u32;

    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < attempts => {
                warn!(
                    task,
                    attempt,
                    error = %e,
                    delay = ?policy.backoff_initial,
                    "task failed, retrying",
                );

                if let Some(counter) = retries {
                    counter.inc();
                }

                tokio::time::sleep(policy.backoff_initial).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
