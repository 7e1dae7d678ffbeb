//! Application service — the worker loop.
//!
//! One job at a time: dequeue by strict priority, run, repeat. The loop
//! heartbeats while idle and while a job runs, so the stale sweep never
//! mistakes a long job for an abandoned one.

use std::time::Duration;

use anyhow::Result;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::application::ports::SharedStore;
use crate::application::services::job_runner::{RunOutcome, run_job};
use crate::application::services::retry::now;
use crate::application::steps::StepRegistry;
use crate::domain::{Backoff, BackoffStep, HostLayout, WorkerSettings};

pub const COMPONENT: &str = "worker";

/// Jobs handled by one `run_worker` call, for logs and tests.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WorkerStats {
    pub completed: u64,
    pub requeued: u64,
    pub skipped: u64,
}

/// Run until `shutdown` is cancelled.
///
/// The token is only checked between jobs; a running job always finishes
/// (the caller bounds that with the shutdown grace period).
///
/// # Errors
///
/// Returns an error once the store has been unreachable for longer than the
/// configured `unhealthy_after`, so the supervisor restarts the process.
pub async fn run_worker(
    store: &impl SharedStore,
    registry: &StepRegistry,
    layout: &HostLayout,
    settings: &WorkerSettings,
    heartbeat_ttl: Duration,
    shutdown: &CancellationToken,
) -> Result<WorkerStats> {
    let instance = settings.runner.instance.as_str();
    let mut stats = WorkerStats::default();
    let mut backoff = Backoff::new(settings.runner.store_retry);
    let mut next_beat = Instant::now();

    tracing::info!(
        %instance,
        queues = ?settings.priorities,
        "worker started"
    );

    while !shutdown.is_cancelled() {
        if Instant::now() >= next_beat {
            beat(store, instance, heartbeat_ttl).await;
            next_beat = Instant::now() + settings.heartbeat_interval;
        }

        // BLPOP is not cancel-safe; its timeout bounds shutdown latency.
        let dequeued = store
            .dequeue(&settings.priorities, settings.dequeue_timeout)
            .await;

        let job_id = match dequeued {
            Ok(Some(job_id)) => {
                backoff.on_success();
                job_id
            }
            Ok(None) => {
                backoff.on_success();
                continue;
            }
            Err(e) => match backoff.on_failure(now()) {
                BackoffStep::Retry(delay) => {
                    tracing::warn!(error = %format!("{e:#}"), delay_ms = delay.as_millis(), "dequeue failed, backing off");
                    pause(delay, shutdown).await;
                    continue;
                }
                BackoffStep::Unhealthy { failing_for } => {
                    tracing::error!(failing_secs = failing_for.as_secs(), "store unavailable, worker unhealthy");
                    return Err(e.context("queue store unavailable"));
                }
            },
        };

        let job = run_job(store, registry, layout, &settings.runner, &job_id);
        tokio::pin!(job);
        let outcome = loop {
            tokio::select! {
                outcome = &mut job => break outcome?,
                () = tokio::time::sleep_until(next_beat) => {
                    beat(store, instance, heartbeat_ttl).await;
                    next_beat = Instant::now() + settings.heartbeat_interval;
                }
            }
        };

        match outcome {
            RunOutcome::Completed(_) | RunOutcome::Rejected => stats.completed += 1,
            RunOutcome::Requeued { .. } => {
                stats.requeued += 1;
                // Keeps a lone contended job from spinning on its own lock.
                pause(settings.lock_retry_delay, shutdown).await;
            }
            RunOutcome::AlreadyTerminal(_) | RunOutcome::InFlight | RunOutcome::Missing => {
                stats.skipped += 1;
            }
        }
    }

    tracing::info!(
        %instance,
        completed = stats.completed,
        requeued = stats.requeued,
        skipped = stats.skipped,
        "worker stopped"
    );
    Ok(stats)
}

async fn beat(store: &impl SharedStore, instance: &str, ttl: Duration) {
    if let Err(e) = store.heartbeat(COMPONENT, instance, ttl).await {
        tracing::warn!(error = %format!("{e:#}"), "heartbeat failed");
    }
}

async fn pause(delay: Duration, shutdown: &CancellationToken) {
    tokio::select! {
        () = tokio::time::sleep(delay) => {}
        () = shutdown.cancelled() => {}
    }
}
