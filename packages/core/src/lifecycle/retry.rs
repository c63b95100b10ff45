use std::future::Future;

use tracing::warn;

use crate::config::RetryPolicy;
use crate::error::{KeyError, KeyResult};

/// Run `op` until it succeeds, fails with a non-transient error, or the
/// attempt budget runs out. Only `KeyError::Unavailable` is retried.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, operation: &'static str, mut op: F) -> KeyResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = KeyResult<T>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut last_error = None;

    for attempt in 1..=attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() => {
                warn!(
                    target: "lifecycle",
                    operation,
                    attempt,
                    max_attempts = attempts,
                    error = %err,
                    "key manager call failed"
                );
                last_error = Some(err);
                if attempt < attempts {
                    tokio::time::sleep(policy.delay_for_attempt(attempt)).await;
                }
            }
            Err(err) => return Err(err),
        }
    }

    Err(last_error.unwrap_or_else(|| KeyError::Unavailable(format!("{} was never attempted", operation))))
}
