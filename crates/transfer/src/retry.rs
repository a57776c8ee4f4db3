//! Fixed-interval bounded retry, cancellable during the wait.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::TransferError;

/// Attempt ceiling and the fixed pause between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. `0` behaves like `1`.
    pub max_attempts: u32,
    pub interval: Duration,
}

impl RetryPolicy {
    pub const fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            interval,
        }
    }

    /// A single attempt, no waiting.
    pub const fn once() -> Self {
        Self::new(1, Duration::ZERO)
    }
}

impl Default for RetryPolicy {
    /// Five attempts, ten seconds apart.
    fn default() -> Self {
        Self::new(5, Duration::from_secs(10))
    }
}

/// Runs `op` until it succeeds or the ceiling is reached.
///
/// `op` receives the 1-based attempt number. `Cancelled` from `op` is not
/// retried. Cancelling `cancel` aborts the wait between attempts. Past the
/// ceiling the last error is returned inside `RetryExhausted`.
pub async fn retry<T, F, Fut>(
    policy: RetryPolicy,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T, TransferError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, TransferError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        attempt += 1;

        let err = match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(TransferError::Cancelled) => return Err(TransferError::Cancelled),
            Err(e) => e,
        };

        if attempt >= max_attempts {
            return Err(TransferError::RetryExhausted {
                attempts: attempt,
                last: Box::new(err),
            });
        }

        warn!(attempt, max_attempts, error = %err, "attempt failed, retrying");
        tokio::select! {
            _ = cancel.cancelled() => return Err(TransferError::Cancelled),
            _ = tokio::time::sleep(policy.interval) => {}
        }
    }
}
