use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::errors::{ReconciliationError, Result};

/// Retries a SQL operation up to 3 times with exponential backoff when the
/// underlying error looks transient (lock/busy), per §5 "retries on
/// transient conflicts are permitted (exponential backoff, max 3 attempts)".
pub async fn with_retry<T, F, Fut>(mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    const MAX_ATTEMPTS: u32 = 3;
    let mut attempt = 0;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient_sql() && attempt < MAX_ATTEMPTS => {
                attempt += 1;
                let backoff = Duration::from_millis(50 * 2u64.pow(attempt));
                warn!(attempt, ?backoff, "transient SQL error, retrying: {}", err);
                tokio::time::sleep(backoff).await;
            }
            Err(err) if err.is_transient_sql() => {
                return Err(ReconciliationError::Transient {
                    attempts: attempt,
                    source: Box::new(err),
                });
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn succeeds_without_retry() {
        let calls = AtomicU32::new(0);
        let result: Result<i32> = with_retry(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(42)
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn propagates_non_transient_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<i32> = with_retry(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(ReconciliationError::Validation("bad".into()))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
