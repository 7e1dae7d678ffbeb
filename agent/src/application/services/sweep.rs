//! Application service — stale-job reconciliation.
//!
//! A job left `running` past the staleness threshold by a worker whose
//! heartbeat has expired is put back on its queue. Steps are re-run from the
//! start; the abandoned step history moves to `previous_attempts` on claim.

use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::application::ports::SharedStore;
use crate::application::services::worker::COMPONENT;
use crate::domain::job::{is_stale, requeued_record};

/// What one sweep pass did.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub requeued: Vec<String>,
    /// Running jobs still owned by a live worker, or not yet stale.
    pub healthy: usize,
    /// Running ids with no payload or record left to requeue.
    pub orphaned: Vec<String>,
}

/// Requeue every abandoned `running` job.
///
/// # Errors
///
/// Returns the first store error; the sweep is a one-shot operator command
/// and is simply run again.
pub async fn sweep_stale(
    store: &impl SharedStore,
    stale_after: Duration,
    now: DateTime<Utc>,
) -> Result<SweepReport> {
    let mut report = SweepReport::default();

    for job_id in store.running_jobs().await? {
        let Some(record) = store.get_status(&job_id).await? else {
            report.orphaned.push(job_id);
            continue;
        };
        if !is_stale(&record, now, stale_after) {
            report.healthy += 1;
            continue;
        }
        if let Some(worker) = &record.worker
            && store.is_alive(COMPONENT, worker).await?
        {
            tracing::debug!(%job_id, %worker, "long-running job still owned by a live worker");
            report.healthy += 1;
            continue;
        }
        let Some(job) = store.get_job(&job_id).await? else {
            tracing::warn!(%job_id, "stale job has no payload, leaving it");
            report.orphaned.push(job_id);
            continue;
        };

        if store.release_lock(&job.resource_id, &job.id).await? {
            tracing::info!(%job_id, resource_id = %job.resource_id, "released lock of abandoned job");
        }
        let worker = record.worker.clone();
        let requeued = requeued_record(Some(record), &job, now);
        store.requeue(&job, &requeued).await?;
        tracing::warn!(%job_id, worker = ?worker, priority = %job.priority, "requeued abandoned job");
        report.requeued.push(job_id);
    }
    Ok(report)
}
