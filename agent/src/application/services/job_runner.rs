//! Application service — run one dequeued job to a terminal status.
//!
//! Imports only from `crate::domain`, `crate::application` and `press_common`.
//! Store calls go through `with_store_retry`; a step failure is recorded in
//! the status record and never surfaces as `Err`.

use std::cell::Cell;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use press_common::{JobPayload, JobStatus, ReloadRequest, ReloadStatus, StatusRecord};

use crate::application::ports::{ClaimOutcome, JobQueue, ReloadChannel, ResourceLocks, StatusStore};
use crate::application::services::retry::with_store_retry;
use crate::application::steps::{EffectClass, StepContext, StepMethod, StepRegistry};
use crate::domain::job::{
    self, Contention, invalid_job_failure, lock_contention_failure, requeued_record,
};
use crate::domain::{HostLayout, JobTracker, RunnerSettings, StepError};

/// Host-wide locks guard short file edits; a crashed holder frees them soon.
const SHARED_LOCK_TTL: Duration = Duration::from_secs(60);
/// Long enough for a crashed holder's lock to expire.
const SHARED_LOCK_WAIT: Duration = Duration::from_secs(120);
const SHARED_LOCK_POLL: Duration = Duration::from_millis(100);

/// What happened to a dequeued job id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Ran (or failed lock acquisition for good) and reached this status.
    Completed(JobStatus),
    /// Duplicate delivery of a job that had already finished or been cancelled.
    AlreadyTerminal(JobStatus),
    /// Duplicate delivery of a job another worker is running.
    InFlight,
    /// Resource lock busy; pushed back on its queue.
    Requeued { attempts: u32 },
    /// Payload failed validation and was recorded as `failure`.
    Rejected,
    /// No payload stored under the id.
    Missing,
}

/// Run the job stored under `job_id`.
///
/// # Errors
///
/// Returns an error only when the store stays unavailable past the retry
/// policy. The job is then left `running` for the stale sweep.
pub async fn run_job(
    store: &(impl JobQueue + StatusStore + ResourceLocks + ReloadChannel),
    registry: &StepRegistry,
    layout: &HostLayout,
    settings: &RunnerSettings,
    job_id: &str,
) -> Result<RunOutcome> {
    let policy = settings.store_retry;

    let Some(job) = with_store_retry(policy, "get job", move || store.get_job(job_id)).await?
    else {
        tracing::warn!(%job_id, "no payload for dequeued job id, dropping");
        return Ok(RunOutcome::Missing);
    };

    match with_store_retry(policy, "claim", move || store.claim(job_id)).await? {
        ClaimOutcome::Claimed => {}
        ClaimOutcome::Terminal(status) => {
            tracing::info!(%job_id, %status, "job already terminal, acknowledging");
            return Ok(RunOutcome::AlreadyTerminal(status));
        }
        ClaimOutcome::InFlight => {
            tracing::info!(%job_id, "job already running elsewhere, dropping duplicate");
            return Ok(RunOutcome::InFlight);
        }
    }

    if let Err(e) = job::validate_job(&job) {
        tracing::error!(%job_id, error = %e, "rejecting invalid job");
        let record = invalid_job_failure(&job, &e, Utc::now());
        persist(store, settings, &record).await?;
        return Ok(RunOutcome::Rejected);
    }

    let job = &job;
    let acquired = with_store_retry(policy, "acquire lock", move || {
        store.acquire_lock(&job.resource_id, &job.id, settings.lock_ttl)
    })
    .await?;
    if !acquired {
        return handle_contention(store, settings, job).await;
    }

    let previous = with_store_retry(policy, "get status", move || store.get_status(&job.id)).await?;
    let mut tracker = JobTracker::start(previous, job, &settings.instance, Utc::now());
    persist(store, settings, tracker.record()).await?;
    tracing::info!(job_id = %job.id, resource_id = %job.resource_id, steps = job.steps.len(), "job started");

    let status = execute_holding_lock(store, registry, layout, settings, job, &mut tracker).await?;

    let released = with_store_retry(policy, "release lock", move || {
        store.release_lock(&job.resource_id, &job.id)
    })
    .await?;
    if !released {
        tracing::warn!(job_id = %job.id, resource_id = %job.resource_id, "lock was no longer held at release");
    }

    tracing::info!(job_id = %job.id, %status, "job finished");
    Ok(RunOutcome::Completed(status))
}

/// Run the steps while renewing the resource lock. If a renewal finds the
/// lock gone, the step in progress is dropped and the job fails with
/// `lock_lost`; another job may already own the resource.
async fn execute_holding_lock(
    store: &(impl StatusStore + ResourceLocks + ReloadChannel),
    registry: &StepRegistry,
    layout: &HostLayout,
    settings: &RunnerSettings,
    job: &JobPayload,
    tracker: &mut JobTracker,
) -> Result<JobStatus> {
    let every = settings.lock_renew_interval();
    let mut renewals = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
    renewals.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let step_started = Cell::new(tokio::time::Instant::now());

    let finished = {
        let steps = execute_steps(store, registry, layout, settings, job, tracker, &step_started);
        tokio::pin!(steps);
        loop {
            tokio::select! {
                status = &mut steps => break Some(status?),
                _ = renewals.tick() => {
                    match store.renew_lock(&job.resource_id, &job.id, settings.lock_ttl).await {
                        Ok(true) => {}
                        Ok(false) => break None,
                        // The next tick retries; the TTL covers two misses.
                        Err(e) => tracing::warn!(
                            job_id = %job.id,
                            resource_id = %job.resource_id,
                            error = %format!("{e:#}"),
                            "lock renewal failed"
                        ),
                    }
                }
            }
        }
    };

    if let Some(status) = finished {
        return Ok(status);
    }
    let elapsed = step_started.get().elapsed();
    tracing::error!(job_id = %job.id, resource_id = %job.resource_id, "resource lock lost, abandoning job");
    tracker.lock_lost(elapsed, Utc::now());
    persist(store, settings, tracker.record()).await?;
    Ok(JobStatus::Failure)
}

async fn execute_steps(
    store: &(impl StatusStore + ResourceLocks + ReloadChannel),
    registry: &StepRegistry,
    layout: &HostLayout,
    settings: &RunnerSettings,
    job: &JobPayload,
    tracker: &mut JobTracker,
    step_started: &Cell<tokio::time::Instant>,
) -> Result<JobStatus> {
    let ctx = StepContext {
        job_id: &job.id,
        resource_id: &job.resource_id,
        layout,
    };

    for step in &job.steps {
        tracker.begin_step(&step.name, Utc::now());
        persist(store, settings, tracker.record()).await?;

        let started = tokio::time::Instant::now();
        step_started.set(started);
        let outcome = match registry.resolve(&step.method) {
            Ok(method) => run_method(store, settings, &ctx, method, &step.args)
                .await?
                .map(|output| (output, method.effect())),
            Err(e) => Err(e),
        };
        let elapsed = started.elapsed();

        match outcome {
            Ok((output, effect)) => {
                tracker.step_succeeded(output, elapsed, Utc::now());
                persist(store, settings, tracker.record()).await?;
                if effect == EffectClass::Routing {
                    request_reload(store, settings, job).await?;
                }
            }
            Err(e) => {
                tracing::warn!(job_id = %job.id, step = %step.name, error = %e, "step failed");
                tracker.step_failed(&e, elapsed, Utc::now());
                persist(store, settings, tracker.record()).await?;
                return Ok(JobStatus::Failure);
            }
        }
    }

    tracker.succeed(Utc::now());
    persist(store, settings, tracker.record()).await?;
    Ok(JobStatus::Success)
}

/// Execute one method, holding its host-wide lock if it names one. The
/// outer `Err` is a store failure; the inner one a step failure.
async fn run_method(
    store: &impl ResourceLocks,
    settings: &RunnerSettings,
    ctx: &StepContext<'_>,
    method: &dyn StepMethod,
    args: &serde_json::Value,
) -> Result<Result<Option<String>, StepError>> {
    let Some(key) = method.shared_lock() else {
        return Ok(method.execute(ctx, args).await);
    };
    let policy = settings.store_retry;
    let job_id = ctx.job_id;
    let deadline = tokio::time::Instant::now() + SHARED_LOCK_WAIT;
    loop {
        let acquired = with_store_retry(policy, "acquire shared lock", move || {
            store.acquire_lock(key, job_id, SHARED_LOCK_TTL)
        })
        .await?;
        if acquired {
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            return Ok(Err(StepError::Command(format!(
                "{key} stayed locked by other jobs for {}s",
                SHARED_LOCK_WAIT.as_secs()
            ))));
        }
        tokio::time::sleep(SHARED_LOCK_POLL).await;
    }

    let result = method.execute(ctx, args).await;
    let released = with_store_retry(policy, "release shared lock", move || {
        store.release_lock(key, job_id)
    })
    .await?;
    if !released {
        tracing::warn!(%job_id, lock = key, "shared lock expired before release");
    }
    Ok(result)
}

async fn handle_contention(
    store: &(impl JobQueue + StatusStore),
    settings: &RunnerSettings,
    job: &JobPayload,
) -> Result<RunOutcome> {
    let policy = settings.store_retry;
    let previous = with_store_retry(policy, "get status", move || store.get_status(&job.id)).await?;

    match job::on_lock_contention(job, settings.max_lock_attempts) {
        Contention::Requeue(next) => {
            let record = requeued_record(previous, &next, Utc::now());
            let (next, record) = (&next, &record);
            with_store_retry(policy, "requeue", move || store.requeue(next, record)).await?;
            tracing::info!(
                job_id = %job.id,
                resource_id = %job.resource_id,
                attempts = next.attempts,
                "resource locked by another job, requeued"
            );
            Ok(RunOutcome::Requeued {
                attempts: next.attempts,
            })
        }
        Contention::Exhausted => {
            tracing::error!(job_id = %job.id, resource_id = %job.resource_id, "lock attempts exhausted");
            let record = lock_contention_failure(previous, job, Utc::now());
            persist(store, settings, &record).await?;
            Ok(RunOutcome::Completed(JobStatus::Failure))
        }
    }
}

async fn request_reload(
    store: &impl ReloadChannel,
    settings: &RunnerSettings,
    job: &JobPayload,
) -> Result<()> {
    let request = ReloadRequest {
        resource_id: job.resource_id.clone(),
        emitted_at: Utc::now(),
        job_id: Some(job.id.clone()),
    };
    let request = &request;
    with_store_retry(settings.store_retry, "publish reload", move || {
        store.publish_reload(request)
    })
    .await?;
    with_store_retry(settings.store_retry, "set reload status", move || {
        store.set_reload_status(&job.id, ReloadStatus::Queued)
    })
    .await?;
    tracing::debug!(job_id = %job.id, resource_id = %job.resource_id, "reload requested");
    Ok(())
}

async fn persist(
    store: &impl StatusStore,
    settings: &RunnerSettings,
    record: &StatusRecord,
) -> Result<()> {
    with_store_retry(settings.store_retry, "set status", move || store.set_status(record)).await
}
