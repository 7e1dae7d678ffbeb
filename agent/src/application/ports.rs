//! Port trait definitions for the Application layer.
//!
//! Ports are the interfaces (contracts) that infrastructure must fulfill.
//! This file imports only from `crate::domain` and `press_common` — never
//! from `crate::infra` or `crate::commands`.

use std::path::Path;
use std::process::Output;
use std::time::Duration;

use anyhow::Result;
use futures::Stream;
use press_common::{
    CoordinatorReport, JobPayload, JobStatus, Priority, ReloadRequest, ReloadStatus, StatusRecord,
};

use crate::domain::{DrainStatus, HostState};

// ── Value Types ───────────────────────────────────────────────────────────────

/// Result of the atomic `queued → running` transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// This worker now owns the job.
    Claimed,
    /// The job already finished (or was cancelled); acknowledge without running.
    Terminal(JobStatus),
    /// Another worker is running it; duplicate delivery, drop it.
    InFlight,
}

/// Output of the proxy's own configuration check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Validation {
    pub ok: bool,
    pub output: String,
}

// ── Shared Queue Store Ports ──────────────────────────────────────────────────

/// Priority job queues and job payloads.
#[allow(async_fn_in_trait)]
pub trait JobQueue {
    /// Store the payload, mark it `queued`, and push its id on its priority list.
    async fn enqueue(&self, job: &JobPayload) -> Result<()>;
    /// Store the (updated) payload and record, then push the id at the tail
    /// of its priority list.
    async fn requeue(&self, job: &JobPayload, record: &StatusRecord) -> Result<()>;
    /// Pop the next job id, checking `priorities` strictly in order.
    /// Returns `None` when nothing arrived within `timeout`.
    async fn dequeue(&self, priorities: &[Priority], timeout: Duration) -> Result<Option<String>>;
    async fn get_job(&self, job_id: &str) -> Result<Option<JobPayload>>;
}

/// Job status records and the claim/cancel cell.
#[allow(async_fn_in_trait)]
pub trait StatusStore {
    /// Atomically move a job from `queued` (or unknown) to `running`.
    async fn claim(&self, job_id: &str) -> Result<ClaimOutcome>;
    /// Cancel a job that has not been claimed yet. Returns `false` otherwise.
    async fn cancel(&self, job_id: &str) -> Result<bool>;
    async fn get_status(&self, job_id: &str) -> Result<Option<StatusRecord>>;
    /// Persist the record and its status cell together.
    async fn set_status(&self, record: &StatusRecord) -> Result<()>;
    /// Ids of every job currently in `running`.
    async fn running_jobs(&self) -> Result<Vec<String>>;
}

/// Per-resource mutual exclusion.
#[allow(async_fn_in_trait)]
pub trait ResourceLocks {
    /// Take the lock for `resource_id` on behalf of `job_id`. Re-acquiring a
    /// lock the job already holds succeeds.
    async fn acquire_lock(&self, resource_id: &str, job_id: &str, ttl: Duration) -> Result<bool>;
    /// Push the expiry of a lock `job_id` still holds out to `ttl`. Returns
    /// `false` if the lock expired or belongs to another job.
    async fn renew_lock(&self, resource_id: &str, job_id: &str, ttl: Duration) -> Result<bool>;
    /// Release only if `job_id` still holds it.
    async fn release_lock(&self, resource_id: &str, job_id: &str) -> Result<bool>;
    async fn lock_holder(&self, resource_id: &str) -> Result<Option<String>>;
}

/// Reload request delivery and coordinator reporting.
#[allow(async_fn_in_trait)]
pub trait ReloadChannel {
    async fn publish_reload(&self, request: &ReloadRequest) -> Result<()>;
    /// Infinite stream of reload requests. Requests delivered but never
    /// acknowledged by a previous subscriber are yielded first. Store errors
    /// are yielded as `Err` items; the stream keeps going afterwards.
    fn subscribe_reloads(
        &self,
        poll_timeout: Duration,
    ) -> impl Stream<Item = Result<ReloadRequest>> + '_;
    /// Acknowledge the `count` oldest delivered requests.
    async fn ack_reloads(&self, count: usize) -> Result<()>;
    async fn set_reload_status(&self, job_id: &str, status: ReloadStatus) -> Result<()>;
    async fn get_reload_status(&self, job_id: &str) -> Result<Option<ReloadStatus>>;
    async fn set_coordinator_report(&self, report: &CoordinatorReport) -> Result<()>;
    async fn get_coordinator_report(&self) -> Result<Option<CoordinatorReport>>;
}

/// Liveness markers with expiry.
#[allow(async_fn_in_trait)]
pub trait Heartbeats {
    async fn heartbeat(&self, component: &str, instance: &str, ttl: Duration) -> Result<()>;
    async fn is_alive(&self, component: &str, instance: &str) -> Result<bool>;
}

/// Composite trait — any type implementing all store sub-traits is a `SharedStore`.
pub trait SharedStore: JobQueue + StatusStore + ResourceLocks + ReloadChannel + Heartbeats {}

/// Blanket implementation: any type implementing all store sub-traits is a `SharedStore`.
impl<T> SharedStore for T where T: JobQueue + StatusStore + ResourceLocks + ReloadChannel + Heartbeats
{}

// ── Proxy Ports ───────────────────────────────────────────────────────────────

/// Reads routing state from the host directories.
#[allow(async_fn_in_trait)]
pub trait HostStateSource {
    async fn load_host_state(&self) -> Result<HostState>;
    /// Delete every site file for `domain` except the most recently modified.
    /// Returns how many files were removed.
    async fn prune_conflicting(&self, domain: &str) -> Result<usize>;
}

/// The reverse proxy: candidate file, validation, activation.
#[allow(async_fn_in_trait)]
pub trait ProxyDriver {
    /// Write the rendered candidate next to (never over) the live file.
    async fn write_candidate(&self, text: &str) -> Result<()>;
    /// Run the proxy's own check against the candidate only.
    async fn validate_candidate(&self) -> Result<Validation>;
    /// Back up the live file as last-known-good, rename the candidate over
    /// it and signal a reload.
    async fn activate_candidate(&self) -> Result<()>;
    /// Put last-known-good back in place and signal a reload.
    async fn restore_last_good(&self) -> Result<()>;
    async fn live_config(&self) -> Result<Option<String>>;
    async fn drain_status(&self) -> Result<DrainStatus>;
}

/// Post-reload health check.
#[allow(async_fn_in_trait)]
pub trait HealthProbe {
    async fn probe(&self) -> Result<()>;
}

// ── Command Runner Port ───────────────────────────────────────────────────────

/// Abstracts process execution so infrastructure can be swapped or mocked.
#[allow(async_fn_in_trait)]
pub trait CommandRunner {
    /// Run a program and capture its output, using the default timeout.
    async fn run(&self, program: &str, args: &[&str]) -> Result<Output>;
    /// Run a program in `dir` with an explicit timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the process cannot be spawned or exceeds `timeout`.
    /// On timeout, the child process must be killed (not left orphaned).
    async fn run_in_dir(
        &self,
        program: &str,
        args: &[&str],
        dir: Option<&Path>,
        timeout: Duration,
    ) -> Result<Output>;
}
