//! Bounded retry with a fixed interval.
//!
//! [`execute`] keeps invoking an operation until it succeeds, fails with an
//! error the classifier calls fatal, or the policy's budget runs out. The
//! wait between attempts is `policy.min_interval`, clamped to the remaining
//! budget, and races the caller's cancellation token. An attempt already in
//! flight is never interrupted.
//!
//! The operation must be safe to repeat: nothing here deduplicates side
//! effects across attempts.

use log::{debug, warn};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

use crate::classify::{Classification, Classify, ErrorClassifier};
use crate::config::RetryPolicy;

/// Why a retried operation gave up.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// The classifier rejected the error; no further attempts were made.
    #[error("{source}")]
    Fatal {
        attempts: u32,
        #[source]
        source: E,
    },

    /// Still failing with retryable errors when the timeout elapsed.
    #[error("deadline of {timeout:?} exceeded after {attempts} attempts: {last}")]
    DeadlineExceeded {
        attempts: u32,
        elapsed: Duration,
        timeout: Duration,
        #[source]
        last: E,
    },

    /// Still failing with retryable errors after `max_attempts` attempts.
    #[error("gave up after {attempts} attempts: {last}")]
    AttemptsExhausted {
        attempts: u32,
        #[source]
        last: E,
    },

    /// The ambient cancellation token fired between attempts.
    #[error("cancelled after {attempts} attempts")]
    Cancelled { attempts: u32, last: Option<E> },
}

impl<E> RetryError<E> {
    /// Number of times the operation was invoked.
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Fatal { attempts, .. }
            | Self::DeadlineExceeded { attempts, .. }
            | Self::AttemptsExhausted { attempts, .. }
            | Self::Cancelled { attempts, .. } => *attempts,
        }
    }

    /// True when the retry budget ran out on retryable errors.
    pub fn is_exhausted(&self) -> bool {
        matches!(
            self,
            Self::DeadlineExceeded { .. } | Self::AttemptsExhausted { .. }
        )
    }

    /// The most recent underlying error, if any attempt failed.
    pub fn last_error(&self) -> Option<&E> {
        match self {
            Self::Fatal { source, .. } => Some(source),
            Self::DeadlineExceeded { last, .. } | Self::AttemptsExhausted { last, .. } => Some(last),
            Self::Cancelled { last, .. } => last.as_ref(),
        }
    }

    pub fn into_last_error(self) -> Option<E> {
        match self {
            Self::Fatal { source, .. } => Some(source),
            Self::DeadlineExceeded { last, .. } | Self::AttemptsExhausted { last, .. } => Some(last),
            Self::Cancelled { last, .. } => last,
        }
    }
}

/// Invoke `op` until it succeeds, `classify` calls an error fatal, or the
/// policy's timeout / attempt budget is used up.
pub async fn execute<T, E, F, Fut, C>(
    mut op: F,
    classify: C,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> Result<T, RetryError<E>>
where
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> Classification,
{
    let started = Instant::now();
    let mut attempts = 0u32;
    let mut last: Option<E> = None;

    loop {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled { attempts, last });
        }

        attempts = attempts.saturating_add(1);
        let err = match op().await {
            Ok(value) => {
                if attempts > 1 {
                    debug!("Retried operation succeeded on attempt {}", attempts);
                }
                return Ok(value);
            }
            Err(err) => err,
        };

        if classify(&err) == Classification::Fatal {
            return Err(RetryError::Fatal {
                attempts,
                source: err,
            });
        }

        let elapsed = started.elapsed();
        if elapsed >= policy.timeout {
            warn!(
                "Retry deadline of {:?} exceeded after {} attempts: {}",
                policy.timeout, attempts, err
            );
            return Err(RetryError::DeadlineExceeded {
                attempts,
                elapsed,
                timeout: policy.timeout,
                last: err,
            });
        }
        if let Some(max_attempts) = policy.max_attempts {
            if attempts >= max_attempts {
                debug!("Retry attempts exhausted ({}): {}", attempts, err);
                return Err(RetryError::AttemptsExhausted { attempts, last: err });
            }
        }

        let wait = policy.min_interval.min(policy.timeout - elapsed);
        debug!(
            "Retryable failure on attempt {} ({}); retrying in {:?}",
            attempts, err, wait
        );
        last = Some(err);

        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(RetryError::Cancelled { attempts, last });
            }
            _ = sleep(wait) => {}
        }
    }
}

/// [`execute`] with an [`ErrorClassifier`] deciding retryability.
pub async fn execute_classified<T, E, F, Fut>(
    op: F,
    classifier: &ErrorClassifier,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> Result<T, RetryError<E>>
where
    E: Classify + Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    execute(op, |err: &E| classifier.classify(err), policy, cancel).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RemoteError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(timeout_secs: u64, interval_secs: u64) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_secs(timeout_secs),
            Duration::from_secs(interval_secs),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_n_retryable_failures() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result = execute_classified(
            move || async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if n <= 3 {
                    Err(RemoteError::not_found("not visible yet"))
                } else {
                    Ok(n)
                }
            },
            &ErrorClassifier::not_found(),
            &policy(10, 1),
            &CancellationToken::new(),
        )
        .await
        .expect("succeeds before the deadline");

        assert_eq!(result, 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_error_stops_after_one_attempt() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let err = execute_classified(
            move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(RemoteError::api(403, "permission denied"))
            },
            &ErrorClassifier::not_found(),
            &policy(10, 1),
            &CancellationToken::new(),
        )
        .await
        .expect_err("fatal error is returned");

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.attempts(), 1);
        match err {
            RetryError::Fatal { source, .. } => assert_eq!(source.status_code(), Some(403)),
            other => panic!("expected fatal error, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_exceeded_wraps_last_error() {
        let started = Instant::now();
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let err = execute_classified(
            move || async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                Err::<(), _>(RemoteError::not_found(format!("attempt {}", n)))
            },
            &ErrorClassifier::not_found(),
            &policy(5, 1),
            &CancellationToken::new(),
        )
        .await
        .expect_err("never succeeds");

        assert!(started.elapsed() >= Duration::from_secs(5));
        assert!(err.is_exhausted());
        let attempts = calls.load(Ordering::SeqCst);
        match &err {
            RetryError::DeadlineExceeded { last, elapsed, .. } => {
                assert!(*elapsed >= Duration::from_secs(5));
                assert_eq!(last.to_string(), format!("API error (404): attempt {}", attempts));
            }
            other => panic!("expected deadline error, got {:?}", other),
        }
        assert!(err.to_string().contains("attempt"));
    }

    #[tokio::test(start_paused = true)]
    async fn attempt_budget_is_honoured() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let err = execute_classified(
            move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(RemoteError::not_found("missing"))
            },
            &ErrorClassifier::not_found(),
            &policy(600, 1).with_max_attempts(3),
            &CancellationToken::new(),
        )
        .await
        .expect_err("budget runs out");

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(matches!(err, RetryError::AttemptsExhausted { attempts: 3, .. }));
        assert!(err.last_error().map(RemoteError::is_not_found).unwrap_or(false));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_aborts_between_attempts() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(2_500)).await;
            trigger.cancel();
        });

        let calls = AtomicU32::new(0);
        let counter = &calls;
        let err = execute_classified(
            move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(RemoteError::not_found("missing"))
            },
            &ErrorClassifier::not_found(),
            &policy(60, 1),
            &cancel,
        )
        .await
        .expect_err("cancelled");

        assert!(matches!(err, RetryError::Cancelled { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(err.last_error().is_some());
    }
}
