//! Utility functions for nodeherd

use crate::common::{Error, Result};
use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Get current Unix timestamp (nanoseconds)
///
/// Master lease deadlines are absolute nanosecond timestamps so that a single
/// stored number is enough to decide expiry.
pub fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos() as i64
}

/// Retry with exponential backoff
///
/// Sleeps `2^attempt * base_delay` between attempts. Non-retryable errors
/// surface immediately; the final error surfaces after `max_attempts`.
pub async fn retry_with_backoff<F, Fut, T>(
    mut f: F,
    max_attempts: usize,
    base_delay: Duration,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = base_delay;

    for attempt in 0..max_attempts {
        match f().await {
            Ok(result) => return Ok(result),
            Err(e) if e.is_retryable() && attempt < max_attempts - 1 => {
                tracing::warn!(
                    "attempt {} failed: {}, retrying in {:?}",
                    attempt + 1,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(e) => return Err(e),
        }
    }

    Err(Error::Internal("max attempts exceeded".into()))
}

/// Poll `condition` every `period` until it reports done, for at most
/// `max_wait`.
///
/// Returns `Error::Timeout` when the deadline passes. The returned future is
/// cancel-safe: racing it inside `select!` abandons the poll cleanly.
pub async fn poll_until<F, Fut>(
    period: Duration,
    max_wait: Duration,
    what: &str,
    mut condition: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let deadline = tokio::time::Instant::now() + max_wait;
    loop {
        if condition().await? {
            return Ok(());
        }
        if tokio::time::Instant::now() + period > deadline {
            return Err(Error::Timeout(format!(
                "{} not settled after {:?}",
                what, max_wait
            )));
        }
        tokio::time::sleep(period).await;
    }
}
