//! Shared exponential-backoff retry loop used by every provider call.
//! Generalizes the ad hoc retry loops in the teacher's Gemini/Whisper
//! clients into one policy: base 2s, cap 10s, max 3 attempts, transient
//! failures only.

use crate::cancel::CancellationToken;
use crate::config::Thresholds;
use crate::error::{CoreError, Result};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Whether a failure is worth retrying. `ProviderTransientFailed` in the
/// spec's taxonomy is this classification, not a public error variant - it
/// never escapes this module.
pub fn is_transient_status(status: u16) -> bool {
    status == 429 || (500..=599).contains(&status)
}

pub async fn with_backoff<T, F, Fut>(
    thresholds: &Thresholds,
    signal: &CancellationToken,
    mut attempt: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay_ms = thresholds.retry_base_delay_ms;
    let mut last_err = None;

    for attempt_no in 1..=thresholds.retry_max_attempts {
        if signal.is_cancelled() {
            return Err(CoreError::Cancelled);
        }

        match attempt().await {
            Ok(value) => return Ok(value),
            Err(e) if is_transient(&e) => {
                warn!(attempt_no, error = %e, "transient provider failure, retrying");
                last_err = Some(e);
                if attempt_no < thresholds.retry_max_attempts {
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
                        _ = signal.cancelled() => return Err(CoreError::Cancelled),
                    }
                    delay_ms = (delay_ms * 2).min(thresholds.retry_cap_delay_ms);
                }
            }
            Err(e) => return Err(e),
        }
    }

    Err(CoreError::ProviderUnavailable(
        last_err.map(|e| e.to_string()).unwrap_or_default(),
    ))
}

fn is_transient(err: &CoreError) -> bool {
    match err {
        CoreError::Http(e) => {
            e.is_timeout() || e.is_connect() || e.status().map(|s| is_transient_status(s.as_u16())).unwrap_or(false)
        }
        CoreError::ProviderUnavailable(_) => true,
        _ => false,
    }
}

type BoxedAttempt<T> = std::pin::Pin<Box<dyn Future<Output = Result<T>> + Send>>;

/// Runs `primary` (itself retried via [`with_backoff`]); if it's still
/// failing once retries are exhausted, falls back to a retried attempt
/// against `fallback` when one is configured. Cancellation and credit
/// exhaustion are not recoverable by switching providers, so both abort
/// immediately rather than trying the fallback. The primary's error is
/// what's surfaced if both legs fail, since that's the provider the
/// caller actually configured as primary.
pub async fn with_fallback<T>(
    thresholds: &Thresholds,
    signal: &CancellationToken,
    mut primary: impl FnMut() -> BoxedAttempt<T>,
    mut fallback: Option<impl FnMut() -> BoxedAttempt<T>>,
) -> Result<T> {
    match with_backoff(thresholds, signal, &mut primary).await {
        Ok(value) => Ok(value),
        Err(primary_err @ (CoreError::Cancelled | CoreError::InsufficientCredits)) => Err(primary_err),
        Err(primary_err) => match fallback.as_mut() {
            Some(fallback) => {
                warn!(error = %primary_err, "primary provider exhausted retries, trying fallback provider");
                match with_backoff(thresholds, signal, fallback).await {
                    Ok(value) => Ok(value),
                    Err(fallback_err) => {
                        warn!(error = %fallback_err, "fallback provider also failed");
                        Err(primary_err)
                    }
                }
            }
            None => Err(primary_err),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[test]
    fn transient_statuses_cover_5xx_and_429() {
        assert!(is_transient_status(429));
        assert!(is_transient_status(500));
        assert!(is_transient_status(599));
        assert!(!is_transient_status(400));
        assert!(!is_transient_status(404));
    }

    #[tokio::test]
    async fn retries_transient_failures_until_success() {
        let thresholds = Thresholds {
            retry_base_delay_ms: 1,
            retry_cap_delay_ms: 2,
            retry_max_attempts: 3,
            ..Thresholds::default()
        };
        let signal = CancellationToken::new();
        let calls = RefCell::new(0);

        let result = with_backoff(&thresholds, &signal, || {
            let mut c = calls.borrow_mut();
            *c += 1;
            let attempt_no = *c;
            async move {
                if attempt_no < 2 {
                    Err(CoreError::ProviderUnavailable("try again".to_string()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(*calls.borrow(), 2);
    }

    #[tokio::test]
    async fn does_not_retry_non_transient_errors() {
        let thresholds = Thresholds::default();
        let signal = CancellationToken::new();
        let calls = RefCell::new(0);

        let result: Result<()> = with_backoff(&thresholds, &signal, || {
            *calls.borrow_mut() += 1;
            async { Err(CoreError::MediaMalformed("bad file".to_string())) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(*calls.borrow(), 1);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let thresholds = Thresholds {
            retry_base_delay_ms: 1,
            retry_cap_delay_ms: 1,
            retry_max_attempts: 3,
            ..Thresholds::default()
        };
        let signal = CancellationToken::new();
        let calls = RefCell::new(0);

        let result: Result<()> = with_backoff(&thresholds, &signal, || {
            *calls.borrow_mut() += 1;
            async { Err(CoreError::ProviderUnavailable("down".to_string())) }
        })
        .await;

        assert!(matches!(result, Err(CoreError::ProviderUnavailable(_))));
        assert_eq!(*calls.borrow(), 3);
    }

    #[tokio::test]
    async fn with_fallback_uses_fallback_when_primary_exhausts_retries() {
        let thresholds = Thresholds {
            retry_base_delay_ms: 1,
            retry_cap_delay_ms: 1,
            retry_max_attempts: 1,
            ..Thresholds::default()
        };
        let signal = CancellationToken::new();

        let result = with_fallback(
            &thresholds,
            &signal,
            || Box::pin(async { Err(CoreError::ProviderUnavailable("primary down".to_string())) }),
            Some(|| -> BoxedAttempt<i32> { Box::pin(async { Ok(7) }) }),
        )
        .await;

        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test]
    async fn with_fallback_surfaces_primary_error_when_both_fail() {
        let thresholds = Thresholds {
            retry_base_delay_ms: 1,
            retry_cap_delay_ms: 1,
            retry_max_attempts: 1,
            ..Thresholds::default()
        };
        let signal = CancellationToken::new();

        let result: Result<i32> = with_fallback(
            &thresholds,
            &signal,
            || Box::pin(async { Err(CoreError::ProviderUnavailable("primary down".to_string())) }),
            Some(|| -> BoxedAttempt<i32> { Box::pin(async { Err(CoreError::ProviderUnavailable("fallback down".to_string())) }) }),
        )
        .await;

        match result {
            Err(CoreError::ProviderUnavailable(msg)) => assert!(msg.contains("primary down")),
            other => panic!("expected primary error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn with_fallback_does_not_try_fallback_on_insufficient_credits() {
        let thresholds = Thresholds::default();
        let signal = CancellationToken::new();
        let fallback_calls = RefCell::new(0);

        let result: Result<i32> = with_fallback(
            &thresholds,
            &signal,
            || Box::pin(async { Err(CoreError::InsufficientCredits) }),
            Some(|| -> BoxedAttempt<i32> {
                *fallback_calls.borrow_mut() += 1;
                Box::pin(async { Ok(1) })
            }),
        )
        .await;

        assert!(matches!(result, Err(CoreError::InsufficientCredits)));
        assert_eq!(*fallback_calls.borrow(), 0);
    }
}
