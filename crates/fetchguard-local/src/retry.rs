//! C4 — Retry Loop: wraps a single fetch attempt with bounded retries,
//! exponential backoff plus jitter, and `Retry-After` honouring on 429.
//!
//! Grounded on the `AttemptBudget`/backoff-executor shape in the pack's
//! `jwks-cache` cache manager (`perform_fetch_with_retry`,
//! `next_backoff`/jitter calculation), adapted to the fetch pipeline's own
//! error taxonomy instead of an HTTP-cache-semantics crate.
use fetchguard_core::{ErrorKind, FetchError};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const MIN_ATTEMPTS: u32 = 1;
const MAX_ATTEMPTS: u32 = 10;
const MAX_BACKOFF: Duration = Duration::from_secs(10);
const MAX_RATE_LIMIT_DELAY: Duration = Duration::from_secs(30);
const JITTER_FRACTION: f64 = 0.25;

/// Whether a failure should be retried, and the delay to wait first.
enum Classification {
    NoRetry,
    RetryAfter(Duration),
}

fn classify(err: &FetchError, attempt: u32) -> Classification {
    match err.kind {
        ErrorKind::Aborted => Classification::NoRetry,
        ErrorKind::RateLimited => {
            let base = err.retry_after_ms.map(Duration::from_millis).unwrap_or(Duration::from_secs(1));
            Classification::RetryAfter(base.min(MAX_RATE_LIMIT_DELAY))
        }
        ErrorKind::Http4xx => Classification::NoRetry,
        ErrorKind::Http5xx | ErrorKind::DnsTimeout | ErrorKind::Enodata | ErrorKind::Timeout => {
            Classification::RetryAfter(backoff_with_jitter(attempt))
        }
        _ => Classification::NoRetry,
    }
}

fn backoff_with_jitter(attempt: u32) -> Duration {
    let base_ms = 1000u64.saturating_mul(1u64 << attempt.saturating_sub(1));
    let base = Duration::from_millis(base_ms).min(MAX_BACKOFF);
    let jitter_range = base.as_secs_f64() * JITTER_FRACTION;
    let delta = rand::thread_rng().gen_range(-jitter_range..=jitter_range);
    let jittered = (base.as_secs_f64() + delta).max(0.0);
    Duration::from_secs_f64(jittered)
}

/// Runs `attempt` up to `attempts` times (clamped to `[1,10]`), retrying per
/// the classification table and honouring cancellation before each attempt.
pub async fn with_retry<F, Fut, T>(
    attempts: u32,
    cancel: &CancellationToken,
    mut attempt: F,
) -> Result<T, FetchError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, FetchError>>,
{
    let attempts = attempts.clamp(MIN_ATTEMPTS, MAX_ATTEMPTS);
    let mut last_err: Option<FetchError> = None;

    for k in 1..=attempts {
        if cancel.is_cancelled() {
            return Err(FetchError::aborted());
        }

        match attempt(k).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if k == attempts {
                    last_err = Some(err);
                    break;
                }
                match classify(&err, k) {
                    Classification::NoRetry => return Err(err),
                    Classification::RetryAfter(delay) => {
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = cancel.cancelled() => return Err(FetchError::aborted()),
                        }
                        last_err = Some(err);
                    }
                }
            }
        }
    }

    let last = last_err.expect("loop always records an error before exhausting attempts");
    Err(FetchError::new(
        last.kind,
        format!("failed after {attempts} attempts: {}", last.message),
    )
    .with_url(last.url.clone().unwrap_or_default())
    .with_status(last.status_code.unwrap_or(502)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retries_on_5xx_then_succeeds() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        let result = with_retry(3, &cancel, |_k| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(FetchError::new(ErrorKind::Http5xx, "boom"))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn non_429_4xx_is_not_retried() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        let result: Result<(), FetchError> = with_retry(5, &cancel, |_k| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(FetchError::new(ErrorKind::Http4xx, "not found")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_short_circuits() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<(), FetchError> = with_retry(5, &cancel, |_k| async { Ok(()) }).await;
        assert_eq!(result.unwrap_err().kind, ErrorKind::Aborted);
    }

    #[test]
    fn backoff_grows_and_is_capped() {
        let d1 = backoff_with_jitter(1).as_secs_f64();
        let d5 = backoff_with_jitter(5).as_secs_f64();
        assert!(d1 <= 1.25 && d1 >= 0.0);
        assert!(d5 <= MAX_BACKOFF.as_secs_f64() * 1.25);
    }
}
