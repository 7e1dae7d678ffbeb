//! Job validation and status-record bookkeeping.
//!
//! `JobTracker` owns the status record of one claimed job while it runs and
//! produces the snapshot persisted after every step.

use std::time::Duration;

use chrono::{DateTime, Utc};
use press_common::{
    FailureReason, JobPayload, JobStatus, StatusRecord, StepRecord, StepStatus,
    validate_job_id, validate_resource_id,
};

use crate::domain::error::{JobError, StepError};

/// Step output is truncated to keep status records small.
pub const MAX_OUTPUT_BYTES: usize = 16 * 1024;

/// Reject payloads that cannot be executed at all.
///
/// # Errors
///
/// Returns the first schema violation found.
pub fn validate_job(job: &JobPayload) -> Result<(), JobError> {
    validate_job_id(&job.id).map_err(|reason| JobError::InvalidId {
        id: job.id.clone(),
        reason,
    })?;
    validate_resource_id(&job.resource_id).map_err(|reason| JobError::InvalidResource {
        id: job.resource_id.clone(),
        reason,
    })?;
    if job.steps.is_empty() {
        return Err(JobError::NoSteps);
    }
    for (index, step) in job.steps.iter().enumerate() {
        if step.name.trim().is_empty() {
            return Err(JobError::EmptyStepField {
                index,
                field: "name",
            });
        }
        if step.method.trim().is_empty() {
            return Err(JobError::EmptyStepField {
                index,
                field: "method",
            });
        }
    }
    Ok(())
}

/// Outcome of a lock-contention requeue decision.
#[derive(Debug, Clone, PartialEq)]
pub enum Contention {
    /// Push this payload (attempts bumped) back on its queue.
    Requeue(JobPayload),
    /// Attempts exhausted; fail with `lock_contention`.
    Exhausted,
}

pub fn on_lock_contention(job: &JobPayload, max_attempts: u32) -> Contention {
    let attempts = job.attempts.saturating_add(1);
    if attempts >= max_attempts {
        Contention::Exhausted
    } else {
        Contention::Requeue(JobPayload {
            attempts,
            ..job.clone()
        })
    }
}

/// A claimed job handed back to the queue, step history untouched.
pub fn requeued_record(
    previous: Option<StatusRecord>,
    job: &JobPayload,
    now: DateTime<Utc>,
) -> StatusRecord {
    let mut record = previous.unwrap_or_else(|| StatusRecord::queued(job, now));
    record.status = JobStatus::Queued;
    record.started_at = None;
    record.ended_at = None;
    record.worker = None;
    record.updated_at = Some(now);
    record
}

pub fn lock_contention_failure(
    previous: Option<StatusRecord>,
    job: &JobPayload,
    now: DateTime<Utc>,
) -> StatusRecord {
    let mut record = previous.unwrap_or_else(|| StatusRecord::queued(job, now));
    record.status = JobStatus::Failure;
    record.reason = Some(FailureReason::LockContention);
    record.ended_at = Some(now);
    record.updated_at = Some(now);
    record
}

pub fn invalid_job_failure(job: &JobPayload, error: &JobError, now: DateTime<Utc>) -> StatusRecord {
    let mut record = StatusRecord::queued(job, now);
    record.status = JobStatus::Failure;
    record.reason = Some(FailureReason::InvalidJob);
    record.steps.push(StepRecord {
        name: "validate".to_string(),
        status: StepStatus::Failure,
        output: None,
        error: Some(error.to_string()),
        duration_ms: 0,
    });
    record.ended_at = Some(now);
    record
}

pub fn cancelled_record(
    previous: Option<StatusRecord>,
    job_id: &str,
    now: DateTime<Utc>,
) -> StatusRecord {
    let mut record = previous.unwrap_or_else(|| StatusRecord {
        id: job_id.to_string(),
        resource_id: String::new(),
        status: JobStatus::Cancelled,
        steps: Vec::new(),
        enqueued_at: None,
        started_at: None,
        ended_at: None,
        updated_at: None,
        reason: None,
        failed_step: None,
        worker: None,
        previous_attempts: Vec::new(),
    });
    record.status = JobStatus::Cancelled;
    record.reason = Some(FailureReason::Cancelled);
    record.ended_at = Some(now);
    record.updated_at = Some(now);
    record
}

/// `running` for longer than `stale_after` (measured from `started_at`).
pub fn is_stale(record: &StatusRecord, now: DateTime<Utc>, stale_after: Duration) -> bool {
    if record.status != JobStatus::Running {
        return false;
    }
    let Some(started) = record.started_at else {
        return true;
    };
    let Ok(threshold) = chrono::Duration::from_std(stale_after) else {
        return false;
    };
    now.signed_duration_since(started) >= threshold
}

// ── Tracker ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct JobTracker {
    record: StatusRecord,
}

impl JobTracker {
    /// Begin an execution. Step history left by an abandoned attempt moves to
    /// `previous_attempts`.
    pub fn start(
        previous: Option<StatusRecord>,
        job: &JobPayload,
        worker: &str,
        now: DateTime<Utc>,
    ) -> Self {
        let mut record = previous.unwrap_or_else(|| StatusRecord::queued(job, now));
        if !record.steps.is_empty() {
            let abandoned = std::mem::take(&mut record.steps);
            record.previous_attempts.push(abandoned);
        }
        record.id.clone_from(&job.id);
        record.resource_id.clone_from(&job.resource_id);
        record.status = JobStatus::Running;
        record.started_at = Some(now);
        record.ended_at = None;
        record.reason = None;
        record.failed_step = None;
        record.worker = Some(worker.to_string());
        record.updated_at = Some(now);
        Self { record }
    }

    pub fn begin_step(&mut self, name: &str, now: DateTime<Utc>) {
        self.record.steps.push(StepRecord {
            name: name.to_string(),
            status: StepStatus::Running,
            output: None,
            error: None,
            duration_ms: 0,
        });
        self.record.updated_at = Some(now);
    }

    pub fn step_succeeded(&mut self, output: Option<String>, elapsed: Duration, now: DateTime<Utc>) {
        if let Some(step) = self.record.steps.last_mut() {
            step.status = StepStatus::Success;
            step.output = output.map(truncate_output);
            step.duration_ms = millis(elapsed);
        }
        self.record.updated_at = Some(now);
    }

    /// Record the failure on the current step and end the job.
    pub fn step_failed(&mut self, error: &StepError, elapsed: Duration, now: DateTime<Utc>) {
        if let Some(step) = self.record.steps.last_mut() {
            step.status = StepStatus::Failure;
            step.error = Some(error.to_string());
            step.duration_ms = millis(elapsed);
            self.record.failed_step = Some(step.name.clone());
        }
        self.record.status = JobStatus::Failure;
        self.record.reason = Some(FailureReason::StepFailed);
        self.record.ended_at = Some(now);
        self.record.updated_at = Some(now);
    }

    /// The resource lock could not be renewed; the step in progress was
    /// abandoned and the job ends without touching the resource further.
    pub fn lock_lost(&mut self, elapsed: Duration, now: DateTime<Utc>) {
        if let Some(step) = self.record.steps.last_mut().filter(|s| s.status == StepStatus::Running) {
            step.status = StepStatus::Failure;
            step.error = Some("resource lock lost".to_string());
            step.duration_ms = millis(elapsed);
            self.record.failed_step = Some(step.name.clone());
        }
        self.record.status = JobStatus::Failure;
        self.record.reason = Some(FailureReason::LockLost);
        self.record.ended_at = Some(now);
        self.record.updated_at = Some(now);
    }

    pub fn succeed(&mut self, now: DateTime<Utc>) {
        self.record.status = JobStatus::Success;
        self.record.ended_at = Some(now);
        self.record.updated_at = Some(now);
    }

    pub fn record(&self) -> &StatusRecord {
        &self.record
    }

    pub fn into_record(self) -> StatusRecord {
        self.record
    }
}

fn millis(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

fn truncate_output(mut output: String) -> String {
    if output.len() > MAX_OUTPUT_BYTES {
        let mut cut = MAX_OUTPUT_BYTES;
        while !output.is_char_boundary(cut) {
            cut -= 1;
        }
        output.truncate(cut);
    }
    output
}
