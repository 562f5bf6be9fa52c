//! Retry and rate-limit handling for upstream calls.
//!
//! Transient failures (transport errors, timeouts, 5xx) are retried with
//! jittered exponential backoff. An explicit rate-limit signal is not a
//! transient failure: the caller waits for the advertised `retry_after`
//! and repeats the identical request, bounded by a [`RateLimitBudget`].

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::CollectorError;

const MAX_BACKOFF_MS: u64 = 60_000;

/// Returns `true` if `err` is a transient condition worth retrying after a
/// backoff delay.
///
/// [`CollectorError::RateLimited`] is deliberately excluded; it is handled
/// by [`RateLimitBudget`] instead.
pub(crate) fn is_retriable(err: &CollectorError) -> bool {
    match err {
        CollectorError::Http(_) | CollectorError::Timeout { .. } => true,
        CollectorError::UnexpectedStatus { status, .. } => *status >= 500,
        _ => false,
    }
}

/// Executes `operation` with exponential backoff retries on transient errors.
///
/// The wait before retry `n` is `backoff_base_ms * 2^(n-1)` capped at 60 s,
/// scaled by a random factor in `[0.75, 1.25)`. With `max_retries = 3` the
/// operation is attempted at most 4 times. Non-retriable errors are returned
/// immediately.
pub(crate) async fn retry_with_backoff<T, F, Fut>(
    max_retries: u32,
    backoff_base_ms: u64,
    mut operation: F,
) -> Result<T, CollectorError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CollectorError>>,
{
    let mut attempt = 0u32;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if !is_retriable(&err) || attempt >= max_retries {
                    return Err(err);
                }
                attempt += 1;
                let computed = backoff_base_ms.saturating_mul(1u64 << (attempt - 1).min(10));
                let capped = computed.min(MAX_BACKOFF_MS);
                #[allow(
                    clippy::cast_possible_truncation,
                    clippy::cast_sign_loss,
                    clippy::cast_precision_loss
                )]
                let delay_ms = (capped as f64 * (rand::random::<f64>() * 0.5 + 0.75)) as u64;
                tracing::warn!(
                    attempt,
                    max_retries,
                    delay_ms,
                    error = %err,
                    "transient upstream error, retrying after backoff"
                );
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            }
        }
    }
}

/// Bounds how long one source may be suspended by upstream throttling.
#[derive(Debug, Clone)]
pub struct RateLimitBudget {
    max_waits: u32,
    max_wait_secs: u64,
    waits_used: u32,
}

impl RateLimitBudget {
    #[must_use]
    pub fn new(max_waits: u32, max_wait_secs: u64) -> Self {
        Self {
            max_waits,
            max_wait_secs,
            waits_used: 0,
        }
    }

    #[must_use]
    pub fn waits_used(&self) -> u32 {
        self.waits_used
    }

    /// Admits one more wait of `retry_after_secs`.
    ///
    /// # Errors
    ///
    /// Returns [`CollectorError::RateLimitBudgetExhausted`] if the wait count
    /// is used up or the requested wait exceeds the per-wait ceiling.
    pub fn admit(
        &mut self,
        source_id: &str,
        retry_after_secs: u64,
    ) -> Result<Duration, CollectorError> {
        if self.waits_used >= self.max_waits || retry_after_secs > self.max_wait_secs {
            return Err(CollectorError::RateLimitBudgetExhausted {
                source_id: source_id.to_owned(),
                waits: self.waits_used,
                retry_after_secs,
            });
        }
        self.waits_used += 1;
        Ok(Duration::from_secs(retry_after_secs))
    }
}

/// Sleeps for `duration` unless `cancel` fires first.
///
/// # Errors
///
/// Returns [`CollectorError::Cancelled`] if the token is cancelled before the
/// sleep completes.
pub(crate) async fn cancellable_sleep(
    duration: Duration,
    cancel: &CancellationToken,
) -> Result<(), CollectorError> {
    tokio::select! {
        () = cancel.cancelled() => Err(CollectorError::Cancelled),
        () = tokio::time::sleep(duration) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn server_error() -> CollectorError {
        CollectorError::UnexpectedStatus {
            status: 503,
            url: "http://gateway.local/channels/chemed/messages".to_owned(),
        }
    }

    #[tokio::test]
    async fn succeeds_immediately_on_first_try() {
        let call_count = Arc::new(AtomicU32::new(0));
        let cc = Arc::clone(&call_count);
        let result = retry_with_backoff(3, 0, || {
            let cc = Arc::clone(&cc);
            async move {
                cc.fetch_add(1, Ordering::SeqCst);
                Ok::<u32, CollectorError>(42)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(call_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_server_errors_then_succeeds() {
        let call_count = Arc::new(AtomicU32::new(0));
        let cc = Arc::clone(&call_count);
        let result = retry_with_backoff(3, 0, || {
            let cc = Arc::clone(&cc);
            async move {
                let n = cc.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(server_error())
                } else {
                    Ok::<u32, CollectorError>(99)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 99);
        assert_eq!(call_count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn propagates_last_error_after_exhausting_retries() {
        let call_count = Arc::new(AtomicU32::new(0));
        let cc = Arc::clone(&call_count);
        let result = retry_with_backoff(2, 0, || {
            let cc = Arc::clone(&cc);
            async move {
                cc.fetch_add(1, Ordering::SeqCst);
                Err::<u32, CollectorError>(CollectorError::Timeout {
                    context: "page fetch".to_owned(),
                    timeout_secs: 1,
                })
            }
        })
        .await;
        // max_retries=2 → 3 total attempts
        assert_eq!(call_count.load(Ordering::SeqCst), 3);
        assert!(matches!(result, Err(CollectorError::Timeout { .. })));
    }

    #[tokio::test]
    async fn does_not_retry_rate_limit_or_not_found() {
        for err in [
            CollectorError::RateLimited {
                source_id: "chemed".to_owned(),
                retry_after_secs: 1,
            },
            CollectorError::NotFound {
                url: "http://gateway.local/x".to_owned(),
            },
        ] {
            let call_count = Arc::new(AtomicU32::new(0));
            let cc = Arc::clone(&call_count);
            let mut err = Some(err);
            let result = retry_with_backoff(3, 0, || {
                let cc = Arc::clone(&cc);
                let e = err.take();
                async move {
                    cc.fetch_add(1, Ordering::SeqCst);
                    match e {
                        Some(e) => Err::<u32, CollectorError>(e),
                        None => Ok(0),
                    }
                }
            })
            .await;
            assert_eq!(call_count.load(Ordering::SeqCst), 1);
            assert!(result.is_err());
        }
    }

    #[test]
    fn client_errors_are_not_retriable() {
        assert!(!is_retriable(&CollectorError::UnexpectedStatus {
            status: 403,
            url: String::new(),
        }));
        assert!(is_retriable(&server_error()));
    }

    #[test]
    fn budget_limits_wait_count_and_length() {
        let mut budget = RateLimitBudget::new(2, 30);
        assert_eq!(budget.admit("chemed", 5).unwrap(), Duration::from_secs(5));
        assert!(matches!(
            budget.admit("chemed", 31),
            Err(CollectorError::RateLimitBudgetExhausted { .. })
        ));
        assert!(budget.admit("chemed", 30).is_ok());
        assert_eq!(budget.waits_used(), 2);
        assert!(matches!(
            budget.admit("chemed", 1),
            Err(CollectorError::RateLimitBudgetExhausted { waits: 2, .. })
        ));
    }

    #[tokio::test]
    async fn cancellable_sleep_returns_cancelled() {
        let token = CancellationToken::new();
        token.cancel();
        let result = cancellable_sleep(Duration::from_secs(3600), &token).await;
        assert!(matches!(result, Err(CollectorError::Cancelled)));
    }
}
