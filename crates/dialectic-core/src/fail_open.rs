//! Fail-open helpers for side channels
//!
//! Notification delivery and status bookkeeping must never abort a
//! generation job. These helpers swallow the error after logging it.
//!
//! Not for the provider call or for saving contributions: those failures
//! decide the job outcome and must propagate.

use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::Result;

/// Await `fut`, logging and discarding any error.
///
/// ```no_run
/// use dialectic_core::fail_open::fail_open;
///
/// async fn example() {
///     let delivered = fail_open("deliver_notification", async { Ok(()) }).await;
///     assert!(delivered.is_some());
/// }
/// ```
pub async fn fail_open<T>(operation: &str, fut: impl Future<Output = Result<T>>) -> Option<T> {
    match fut.await {
        Ok(val) => Some(val),
        Err(e) => {
            warn!(operation, error = %e, "operation failed (fail-open)");
            None
        }
    }
}

/// Retry `make` up to `attempts` times, sleeping `backoff * attempt` between
/// tries, then give up with a warning.
pub async fn fail_open_with_retries<F, Fut, T>(
    operation: &str,
    attempts: usize,
    backoff: Duration,
    mut make: F,
) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = attempts.max(1);
    for attempt in 1..=attempts {
        match make().await {
            Ok(val) => return Some(val),
            Err(e) if attempt == attempts => {
                warn!(operation, attempts, error = %e, "giving up (fail-open)");
            }
            Err(e) => {
                warn!(operation, attempt, attempts, error = %e, "attempt failed, retrying");
                tokio::time::sleep(backoff * attempt as u32).await;
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DialecticError;

    #[tokio::test]
    async fn test_fail_open_passes_value_through() {
        let result = fail_open("store_status", async { Ok::<_, DialecticError>(7) }).await;
        assert_eq!(result, Some(7));
    }

    #[tokio::test]
    async fn test_fail_open_swallows_error() {
        let result = fail_open("store_status", async {
            Err::<(), _>(DialecticError::Storage("unavailable".to_string()))
        })
        .await;
        assert_eq!(result, None);
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let mut calls = 0;
        let result = fail_open_with_retries("deliver", 3, Duration::ZERO, || {
            calls += 1;
            let current = calls;
            async move {
                if current < 3 {
                    Err(DialecticError::Storage("flaky".to_string()))
                } else {
                    Ok(current)
                }
            }
        })
        .await;
        assert_eq!(result, Some(3));
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let mut calls = 0;
        let result = fail_open_with_retries("deliver", 2, Duration::ZERO, || {
            calls += 1;
            async { Err::<(), _>(DialecticError::Other("down".to_string())) }
        })
        .await;
        assert_eq!(result, None);
        assert_eq!(calls, 2);
    }
}
