//! Application service — job submission, cancellation and status lookup.
//!
//! These back the operator subcommands; the control plane talks to the same
//! store layout directly.

use anyhow::{Context, Result};
use chrono::Utc;
use press_common::{JobPayload, JobStatus, StatusRecord};

use crate::application::ports::{JobQueue, StatusStore};
use crate::domain::job::{cancelled_record, validate_job};

/// Validate and enqueue a job.
///
/// # Errors
///
/// Returns an error if the payload is invalid or the store write fails.
pub async fn submit_job(queue: &impl JobQueue, job: &JobPayload) -> Result<()> {
    validate_job(job).with_context(|| format!("job {} rejected", job.id))?;
    queue.enqueue(job).await
}

#[derive(Debug, Clone, PartialEq)]
pub enum CancelOutcome {
    Cancelled(StatusRecord),
    /// Already claimed or finished; carries the current status if any.
    NotCancellable(Option<JobStatus>),
}

/// Cancel a job that no worker has claimed yet.
///
/// # Errors
///
/// Returns an error on store failure.
pub async fn cancel_job(store: &impl StatusStore, job_id: &str) -> Result<CancelOutcome> {
    if store.cancel(job_id).await? {
        let previous = store.get_status(job_id).await?;
        let record = cancelled_record(previous, job_id, Utc::now());
        store.set_status(&record).await?;
        tracing::info!(%job_id, "job cancelled");
        return Ok(CancelOutcome::Cancelled(record));
    }
    let current = store.get_status(job_id).await?.map(|r| r.status);
    Ok(CancelOutcome::NotCancellable(current))
}
