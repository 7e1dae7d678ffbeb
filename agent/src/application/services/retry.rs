//! Application service — store-call retry with exponential backoff.
//!
//! Store errors are transient until they have persisted for the policy's
//! `give_up_after`; only then does the caller see the error.

use std::future::Future;

use anyhow::Result;

use crate::domain::{Backoff, BackoffPolicy, BackoffStep};

pub(crate) fn now() -> std::time::Instant {
    tokio::time::Instant::now().into_std()
}

/// Retry `op` until it succeeds or the store is considered unhealthy.
///
/// # Errors
///
/// Returns the last error once failures have lasted longer than
/// `policy.give_up_after`.
pub async fn with_store_retry<T, F, Fut>(policy: BackoffPolicy, what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut backoff = Backoff::new(policy);
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => match backoff.on_failure(now()) {
                BackoffStep::Retry(delay) => {
                    tracing::warn!(operation = what, error = %format!("{e:#}"), delay_ms = delay.as_millis(), "store call failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                BackoffStep::Unhealthy { failing_for } => {
                    return Err(e.context(format!(
                        "{what}: store unavailable for {}s",
                        failing_for.as_secs()
                    )));
                }
            },
        }
    }
}
