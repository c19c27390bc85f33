//! Fixed-interval polling bounded by an overall deadline.
//!
//! Every attempt reports either success or a [`RetryError`]. Minor errors are
//! retried on the next tick until the deadline expires; severe errors abort
//! immediately. Coded errors start out minor and are promoted to severe once
//! they have been retried for longer than the severe threshold.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

/// Classification of a failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryError<E> {
    /// Retried on the next tick.
    Minor(E),
    /// Aborts the loop.
    Severe(E),
}

/// Why a retry loop gave up.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryFailure<E> {
    Severe(E),
    /// The deadline expired. Carries the last minor error, if any attempt
    /// completed before it.
    Timeout(Option<E>),
}

/// Number of attempts a coded error is tolerated before it becomes severe.
pub fn severe_attempts(interval: Duration, severe_threshold: Duration) -> u32 {
    if interval.is_zero() {
        return u32::MAX;
    }
    (severe_threshold.as_nanos() / interval.as_nanos()).min(u32::MAX as u128) as u32
}

/// Minor while `attempt` is within `threshold`, severe afterwards.
pub fn minor_or_severe<E>(attempt: u32, threshold: u32, err: E) -> RetryError<E> {
    if attempt > threshold {
        RetryError::Severe(err)
    } else {
        RetryError::Minor(err)
    }
}

/// Runs `operation` immediately and then once per `interval` until it
/// succeeds, fails severely, or `timeout` expires. The attempt number
/// (starting at 1) is passed to every invocation. An attempt in flight when
/// the deadline expires is cancelled.
pub async fn until_timeout<F, Fut, T, E>(
    interval: Duration,
    timeout: Duration,
    mut operation: F,
) -> Result<T, RetryFailure<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, RetryError<E>>>,
    E: std::fmt::Display,
{
    let mut last: Option<E> = None;

    let outcome = tokio::time::timeout(timeout, async {
        let mut attempt = 0u32;
        loop {
            attempt = attempt.saturating_add(1);
            match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(RetryError::Severe(err)) => return Err(err),
                Err(RetryError::Minor(err)) => {
                    debug!(attempt, error = %err, "attempt failed, retrying");
                    last = Some(err);
                }
            }
            tokio::time::sleep(interval).await;
        }
    })
    .await;

    match outcome {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(RetryFailure::Severe(err)),
        Err(_elapsed) => Err(RetryFailure::Timeout(last)),
    }
}
