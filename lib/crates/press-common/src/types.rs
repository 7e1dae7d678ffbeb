use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Queue priority class. Workers drain `High` before `Default` before `Low`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Default,
    Low,
}

impl Priority {
    /// All priorities in strict dequeue order.
    pub const ALL: [Priority; 3] = [Priority::High, Priority::Default, Priority::Low];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Default => "default",
            Priority::Low => "low",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown enum label.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} '{value}'")]
pub struct ParseLabelError {
    pub kind: &'static str,
    pub value: String,
}

impl FromStr for Priority {
    type Err = ParseLabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "high" => Ok(Priority::High),
            "default" => Ok(Priority::Default),
            "low" => Ok(Priority::Low),
            other => Err(ParseLabelError {
                kind: "priority",
                value: other.to_string(),
            }),
        }
    }
}

/// One step of a job as submitted by the control plane.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepSpec {
    pub name: String,
    pub method: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

/// Job payload as carried on the queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobPayload {
    pub id: String,
    #[serde(default)]
    pub priority: Priority,
    pub resource_id: String,
    pub steps: Vec<StepSpec>,
    pub created_at: DateTime<Utc>,
    /// Number of times the job was put back because its resource was locked.
    #[serde(default)]
    pub attempts: u32,
}

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Success,
    Failure,
    Cancelled,
}

impl JobStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Success => "success",
            JobStatus::Failure => "failure",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// Terminal statuses are never left again.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Success | JobStatus::Failure | JobStatus::Cancelled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = ParseLabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "success" => Ok(JobStatus::Success),
            "failure" => Ok(JobStatus::Failure),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(ParseLabelError {
                kind: "job status",
                value: other.to_string(),
            }),
        }
    }
}

/// Status of a single step inside a status record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Running,
    Success,
    Failure,
}

/// Recorded outcome of one step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepRecord {
    pub name: String,
    pub status: StepStatus,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub duration_ms: u64,
}

/// Why a job ended in `failure` or `cancelled`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    StepFailed,
    LockContention,
    /// The resource lock expired or was taken over while steps were running.
    LockLost,
    InvalidJob,
    Cancelled,
}

/// Status record polled by the control plane.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusRecord {
    pub id: String,
    #[serde(default)]
    pub resource_id: String,
    pub status: JobStatus,
    #[serde(default)]
    pub steps: Vec<StepRecord>,
    #[serde(default)]
    pub enqueued_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<FailureReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<String>,
    /// Worker instance that claimed the job (`hostname-pid`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<String>,
    /// Step histories of earlier executions abandoned by a crashed worker.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub previous_attempts: Vec<Vec<StepRecord>>,
}

impl StatusRecord {
    /// Fresh `queued` record for a newly submitted job.
    #[must_use]
    pub fn queued(job: &JobPayload, now: DateTime<Utc>) -> Self {
        Self {
            id: job.id.clone(),
            resource_id: job.resource_id.clone(),
            status: JobStatus::Queued,
            steps: Vec::new(),
            enqueued_at: Some(now),
            started_at: None,
            ended_at: None,
            updated_at: Some(now),
            reason: None,
            failed_step: None,
            worker: None,
            previous_attempts: Vec::new(),
        }
    }
}

/// Signal that routing-relevant host state changed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReloadRequest {
    pub resource_id: String,
    pub emitted_at: DateTime<Utc>,
    /// Job that emitted the request; used to report the reload outcome back.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
}

/// Per-job outcome of the reload its routing change requested.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReloadStatus {
    Queued,
    Success,
    Failure,
    Skipped,
}

impl ReloadStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ReloadStatus::Queued => "queued",
            ReloadStatus::Success => "success",
            ReloadStatus::Failure => "failure",
            ReloadStatus::Skipped => "skipped",
        }
    }
}

/// States of the reload coordinator.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CoordinatorState {
    #[default]
    Idle,
    Collecting,
    Rendering,
    Validating,
    Swapping,
    FailedValidation,
}

impl fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CoordinatorState::Idle => "idle",
            CoordinatorState::Collecting => "collecting",
            CoordinatorState::Rendering => "rendering",
            CoordinatorState::Validating => "validating",
            CoordinatorState::Swapping => "swapping",
            CoordinatorState::FailedValidation => "failed-validation",
        };
        f.write_str(label)
    }
}

/// How a render/validate/swap cycle ended.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CycleOutcome {
    Activated,
    ValidationFailed,
    ActivationFailed,
    Postponed,
}

/// Coordinator status published for the control plane.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct CoordinatorReport {
    pub state: CoordinatorState,
    #[serde(default)]
    pub last_reload_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_outcome: Option<CycleOutcome>,
    #[serde(default)]
    pub last_error: Option<String>,
    /// Distinct resources waiting in the current batch.
    #[serde(default)]
    pub pending_resources: usize,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}
