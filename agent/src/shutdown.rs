//! SIGTERM/SIGINT handling and the bounded shutdown grace period.

use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;

/// Install a handler that cancels the returned token on SIGTERM or SIGINT.
///
/// # Errors
///
/// Returns an error if either signal handler cannot be registered.
pub fn install_shutdown_handler() -> Result<CancellationToken> {
    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;

    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
            _ = sigint.recv() => tracing::info!("received SIGINT, shutting down"),
        }
        trigger.cancel();
    });
    Ok(token)
}

/// Drive `work` to completion, but once `token` is cancelled give it at most
/// `grace` to wind down. Work still running after that is dropped.
///
/// # Errors
///
/// Returns whatever `work` returns when it finishes on its own.
pub async fn run_with_grace<F>(work: F, token: &CancellationToken, grace: Duration) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    tokio::pin!(work);
    tokio::select! {
        result = &mut work => result,
        () = token.cancelled() => {
            if let Ok(result) = tokio::time::timeout(grace, &mut work).await {
                result
            } else {
                tracing::warn!(grace_secs = grace.as_secs(), "grace period elapsed, abandoning current work");
                Ok(())
            }
        }
    }
}
