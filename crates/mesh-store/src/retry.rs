use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::{StoreError, StoreResult};

/// Bounded fixed-delay retry for transient store failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub attempts: u32,
    /// Fixed pause between attempts.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_millis(100),
        }
    }
}

/// Run `op` up to `policy.attempts` times, sleeping `policy.delay` between
/// transient failures. Non-transient errors abort immediately.
pub async fn retry<T, F, Fut>(policy: RetryPolicy, op_name: &str, mut op: F) -> StoreResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StoreResult<T>>,
{
    let attempts = policy.attempts.max(1);
    let mut last = None;
    for attempt in 1..=attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < attempts => {
                warn!(op = op_name, attempt, "transient store failure, retrying: {err}");
                last = Some(err);
                tokio::time::sleep(policy.delay).await;
            }
            Err(err) => return Err(err),
        }
    }
    Err(last.unwrap_or_else(|| StoreError::internal("retry loop exhausted without an error")))
}
