//! Bounded retry with a fixed backoff.

use std::future::Future;
use std::time::Duration;

use crate::error::DovesnapResult;

/// Fixed attempt count and fixed sleep between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first.
    pub attempts: u32,
    /// Sleep between attempts.
    pub delay: Duration,
}

impl RetryPolicy {
    /// Runtime lookups: 3 attempts, 1s apart.
    pub const RUNTIME: Self = Self {
        attempts: 3,
        delay: Duration::from_secs(1),
    };

    /// Waiting for the switch at startup: 5 attempts, 5s apart.
    pub const SWITCH_STARTUP: Self = Self {
        attempts: 5,
        delay: Duration::from_secs(5),
    };

    /// Controller RPCs: 3 attempts, 1s apart.
    pub const CONTROLLER: Self = Self {
        attempts: 3,
        delay: Duration::from_secs(1),
    };

    /// A policy that never retries.
    pub const ONCE: Self = Self {
        attempts: 1,
        delay: Duration::ZERO,
    };
}

/// Run `op` until it succeeds, fails with a non-transient error, or the
/// policy's attempts are used up. The last error is returned.
pub async fn retry<T, F, Fut>(policy: RetryPolicy, what: &str, mut op: F) -> DovesnapResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = DovesnapResult<T>>,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < attempts && e.is_transient() => {
                tracing::debug!(what, attempt, error = %e, "Retrying");
                tokio::time::sleep(policy.delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
