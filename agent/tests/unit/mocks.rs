//! Shared in-memory port implementations for unit tests.
//!
//! `MemoryStore` follows the Valkey layout semantics (claim cell, running
//! set, reliable reload list) closely enough for service-level tests. All
//! waiting is done with short `tokio::time::sleep` polls so tests can run on
//! a paused clock.

#![allow(clippy::expect_used, clippy::unwrap_used, dead_code)]

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use futures::Stream;
use press_agent::application::ports::{
    ClaimOutcome, HealthProbe, Heartbeats, HostStateSource, JobQueue, ProxyDriver, ReloadChannel,
    ResourceLocks, StatusStore, Validation,
};
use press_agent::application::steps::{EffectClass, StepContext, StepMethod};
use press_agent::domain::proxy_config::HostState;
use press_agent::domain::reload::DrainStatus;
use press_agent::domain::{BackoffPolicy, RunnerSettings, StepError, WorkerSettings};
use press_common::{
    CoordinatorReport, CoordinatorState, JobPayload, JobStatus, Priority, ReloadRequest,
    ReloadStatus, StatusRecord, StepSpec,
};
use serde_json::Value;
use tokio::time::Instant;

const POLL: Duration = Duration::from_millis(20);

// ── Builders ──────────────────────────────────────────────────────────────────

pub fn job(id: &str, priority: Priority, resource: &str, steps: &[(&str, &str)]) -> JobPayload {
    JobPayload {
        id: id.to_string(),
        priority,
        resource_id: resource.to_string(),
        steps: steps
            .iter()
            .map(|(name, method)| StepSpec {
                name: (*name).to_string(),
                method: (*method).to_string(),
                args: Value::Null,
            })
            .collect(),
        created_at: Utc::now(),
        attempts: 0,
    }
}

pub fn retry_policy() -> BackoffPolicy {
    BackoffPolicy {
        initial: Duration::from_millis(50),
        max: Duration::from_millis(400),
        give_up_after: Duration::from_secs(2),
    }
}

pub fn runner_settings(instance: &str) -> RunnerSettings {
    RunnerSettings {
        instance: instance.to_string(),
        lock_ttl: Duration::from_secs(600),
        max_lock_attempts: 5,
        store_retry: retry_policy(),
    }
}

pub fn worker_settings(instance: &str) -> WorkerSettings {
    WorkerSettings {
        priorities: Priority::ALL.to_vec(),
        dequeue_timeout: Duration::from_secs(1),
        lock_retry_delay: Duration::from_millis(200),
        heartbeat_interval: Duration::from_secs(5),
        runner: runner_settings(instance),
    }
}

pub fn reload_request(resource: &str, job_id: Option<&str>) -> ReloadRequest {
    ReloadRequest {
        resource_id: resource.to_string(),
        emitted_at: Utc::now(),
        job_id: job_id.map(str::to_string),
    }
}

// ── Memory store ──────────────────────────────────────────────────────────────

#[derive(Default)]
struct Inner {
    queues: BTreeMap<Priority, VecDeque<String>>,
    jobs: HashMap<String, JobPayload>,
    states: HashMap<String, JobStatus>,
    statuses: HashMap<String, StatusRecord>,
    running: BTreeSet<String>,
    /// Holder and expiry on the tokio clock.
    locks: HashMap<String, (String, Instant)>,
    lock_log: Vec<String>,
    /// Newest first, like the Valkey list after `LPUSH`.
    reload_pending: VecDeque<ReloadRequest>,
    reload_processing: VecDeque<ReloadRequest>,
    published: Vec<ReloadRequest>,
    acked: usize,
    reload_statuses: HashMap<String, ReloadStatus>,
    reports: Vec<CoordinatorReport>,
    heartbeats: BTreeSet<(String, String)>,
    failing: bool,
}

/// In-memory stand-in for the Valkey store.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    fn check(&self) -> Result<()> {
        if self.lock().failing {
            anyhow::bail!("connection refused");
        }
        Ok(())
    }

    /// Make every store call fail until reset.
    pub fn set_failing(&self, failing: bool) {
        self.lock().failing = failing;
    }

    pub fn status(&self, job_id: &str) -> Option<StatusRecord> {
        self.lock().statuses.get(job_id).cloned()
    }

    pub fn state(&self, job_id: &str) -> Option<JobStatus> {
        self.lock().states.get(job_id).copied()
    }

    pub fn queue(&self, priority: Priority) -> Vec<String> {
        self.lock()
            .queues
            .get(&priority)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn stored_job(&self, job_id: &str) -> Option<JobPayload> {
        self.lock().jobs.get(job_id).cloned()
    }

    /// Put a record in place as if a worker had claimed the job and died.
    pub fn force_running(&self, record: StatusRecord) {
        let mut inner = self.lock();
        inner.states.insert(record.id.clone(), JobStatus::Running);
        inner.running.insert(record.id.clone());
        inner.statuses.insert(record.id.clone(), record);
    }

    /// Hand the lock to `job_id` for an hour, whoever held it before.
    pub fn hold_lock(&self, resource_id: &str, job_id: &str) {
        self.lock().locks.insert(
            resource_id.to_string(),
            (job_id.to_string(), Instant::now() + Duration::from_secs(3600)),
        );
    }

    pub fn lock_log(&self) -> Vec<String> {
        self.lock().lock_log.clone()
    }

    pub fn published(&self) -> Vec<ReloadRequest> {
        self.lock().published.clone()
    }

    pub fn acked(&self) -> usize {
        self.lock().acked
    }

    pub fn processing_len(&self) -> usize {
        self.lock().reload_processing.len()
    }

    pub fn reload_status(&self, job_id: &str) -> Option<ReloadStatus> {
        self.lock().reload_statuses.get(job_id).copied()
    }

    /// Every coordinator state published, in order.
    pub fn states(&self) -> Vec<CoordinatorState> {
        self.lock().reports.iter().map(|r| r.state).collect()
    }

    pub fn last_report(&self) -> Option<CoordinatorReport> {
        self.lock().reports.last().cloned()
    }

    pub fn has_heartbeat(&self, component: &str) -> bool {
        self.lock().heartbeats.iter().any(|(c, _)| c == component)
    }

    /// Simulate a crashed coordinator that took requests but never acked.
    pub fn leave_in_processing(&self, request: ReloadRequest) {
        self.lock().reload_processing.push_front(request);
    }

    /// Store the payload and push its id, as `submit_job` would.
    pub async fn seed(&self, job: &JobPayload) {
        JobQueue::enqueue(self, job).await.unwrap();
    }

    /// Store a payload without queueing it.
    pub fn put_job(&self, job: &JobPayload) {
        self.lock().jobs.insert(job.id.clone(), job.clone());
    }

    /// Push an id without touching the stored payload or status.
    pub fn push_id(&self, priority: Priority, job_id: &str) {
        self.lock()
            .queues
            .entry(priority)
            .or_default()
            .push_back(job_id.to_string());
    }
}

impl JobQueue for MemoryStore {
    async fn enqueue(&self, job: &JobPayload) -> Result<()> {
        self.check()?;
        let mut inner = self.lock();
        if !inner.states.contains_key(&job.id) {
            inner.jobs.insert(job.id.clone(), job.clone());
            inner.states.insert(job.id.clone(), JobStatus::Queued);
            inner
                .statuses
                .insert(job.id.clone(), StatusRecord::queued(job, Utc::now()));
        }
        inner
            .queues
            .entry(job.priority)
            .or_default()
            .push_back(job.id.clone());
        Ok(())
    }

    async fn requeue(&self, job: &JobPayload, record: &StatusRecord) -> Result<()> {
        self.check()?;
        let mut inner = self.lock();
        inner.jobs.insert(job.id.clone(), job.clone());
        inner.states.insert(job.id.clone(), JobStatus::Queued);
        inner.statuses.insert(job.id.clone(), record.clone());
        inner.running.remove(&job.id);
        inner
            .queues
            .entry(job.priority)
            .or_default()
            .push_back(job.id.clone());
        Ok(())
    }

    async fn dequeue(&self, priorities: &[Priority], timeout: Duration) -> Result<Option<String>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            self.check()?;
            {
                let mut inner = self.lock();
                for priority in priorities {
                    if let Some(id) = inner.queues.get_mut(priority).and_then(VecDeque::pop_front) {
                        return Ok(Some(id));
                    }
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(POLL).await;
        }
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<JobPayload>> {
        self.check()?;
        Ok(self.lock().jobs.get(job_id).cloned())
    }
}

impl StatusStore for MemoryStore {
    async fn claim(&self, job_id: &str) -> Result<ClaimOutcome> {
        self.check()?;
        let mut inner = self.lock();
        match inner.states.get(job_id).copied() {
            None | Some(JobStatus::Queued) => {
                inner.states.insert(job_id.to_string(), JobStatus::Running);
                inner.running.insert(job_id.to_string());
                Ok(ClaimOutcome::Claimed)
            }
            Some(JobStatus::Running) => Ok(ClaimOutcome::InFlight),
            Some(terminal) => Ok(ClaimOutcome::Terminal(terminal)),
        }
    }

    async fn cancel(&self, job_id: &str) -> Result<bool> {
        self.check()?;
        let mut inner = self.lock();
        if inner.states.get(job_id) == Some(&JobStatus::Queued) {
            inner.states.insert(job_id.to_string(), JobStatus::Cancelled);
            return Ok(true);
        }
        Ok(false)
    }

    async fn get_status(&self, job_id: &str) -> Result<Option<StatusRecord>> {
        self.check()?;
        Ok(self.lock().statuses.get(job_id).cloned())
    }

    async fn set_status(&self, record: &StatusRecord) -> Result<()> {
        self.check()?;
        let mut inner = self.lock();
        inner.states.insert(record.id.clone(), record.status);
        if record.status == JobStatus::Running {
            inner.running.insert(record.id.clone());
        } else {
            inner.running.remove(&record.id);
        }
        inner.statuses.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn running_jobs(&self) -> Result<Vec<String>> {
        self.check()?;
        Ok(self.lock().running.iter().cloned().collect())
    }
}

impl Inner {
    /// Current holder, dropping the entry once its TTL has passed.
    fn live_holder(&mut self, resource_id: &str) -> Option<String> {
        match self.locks.get(resource_id) {
            Some((_, expires)) if *expires <= Instant::now() => {
                self.locks.remove(resource_id);
                None
            }
            Some((holder, _)) => Some(holder.clone()),
            None => None,
        }
    }
}

impl ResourceLocks for MemoryStore {
    async fn acquire_lock(&self, resource_id: &str, job_id: &str, ttl: Duration) -> Result<bool> {
        self.check()?;
        let mut inner = self.lock();
        match inner.live_holder(resource_id) {
            Some(holder) if holder != job_id => Ok(false),
            _ => {
                inner
                    .locks
                    .insert(resource_id.to_string(), (job_id.to_string(), Instant::now() + ttl));
                inner.lock_log.push(format!("acquire {resource_id} {job_id}"));
                Ok(true)
            }
        }
    }

    async fn renew_lock(&self, resource_id: &str, job_id: &str, ttl: Duration) -> Result<bool> {
        self.check()?;
        let mut inner = self.lock();
        if inner.live_holder(resource_id).as_deref() != Some(job_id) {
            return Ok(false);
        }
        inner
            .locks
            .insert(resource_id.to_string(), (job_id.to_string(), Instant::now() + ttl));
        Ok(true)
    }

    async fn release_lock(&self, resource_id: &str, job_id: &str) -> Result<bool> {
        self.check()?;
        let mut inner = self.lock();
        if inner.live_holder(resource_id).as_deref() == Some(job_id) {
            inner.locks.remove(resource_id);
            inner.lock_log.push(format!("release {resource_id} {job_id}"));
            return Ok(true);
        }
        Ok(false)
    }

    async fn lock_holder(&self, resource_id: &str) -> Result<Option<String>> {
        self.check()?;
        Ok(self.lock().live_holder(resource_id))
    }
}

impl ReloadChannel for MemoryStore {
    async fn publish_reload(&self, request: &ReloadRequest) -> Result<()> {
        self.check()?;
        let mut inner = self.lock();
        inner.reload_pending.push_front(request.clone());
        inner.published.push(request.clone());
        Ok(())
    }

    fn subscribe_reloads(
        &self,
        poll_timeout: Duration,
    ) -> impl Stream<Item = Result<ReloadRequest>> + '_ {
        async_stream::stream! {
            let backlog: Vec<ReloadRequest> = self.lock().reload_processing.iter().rev().cloned().collect();
            for request in backlog {
                yield Ok(request);
            }
            loop {
                let deadline = tokio::time::Instant::now() + poll_timeout;
                let moved = loop {
                    if let Err(e) = self.check() {
                        break Err(e);
                    }
                    let next = {
                        let mut inner = self.lock();
                        let item = inner.reload_pending.pop_back();
                        if let Some(request) = &item {
                            inner.reload_processing.push_front(request.clone());
                        }
                        item
                    };
                    if next.is_some() || tokio::time::Instant::now() >= deadline {
                        break Ok(next);
                    }
                    tokio::time::sleep(POLL).await;
                };
                match moved {
                    Ok(Some(request)) => yield Ok(request),
                    Ok(None) => {}
                    Err(e) => {
                        yield Err(e);
                        tokio::time::sleep(POLL).await;
                    }
                }
            }
        }
    }

    async fn ack_reloads(&self, count: usize) -> Result<()> {
        self.check()?;
        let mut inner = self.lock();
        for _ in 0..count {
            inner.reload_processing.pop_back();
        }
        inner.acked += count;
        Ok(())
    }

    async fn set_reload_status(&self, job_id: &str, status: ReloadStatus) -> Result<()> {
        self.check()?;
        self.lock()
            .reload_statuses
            .insert(job_id.to_string(), status);
        Ok(())
    }

    async fn get_reload_status(&self, job_id: &str) -> Result<Option<ReloadStatus>> {
        self.check()?;
        Ok(self.lock().reload_statuses.get(job_id).copied())
    }

    async fn set_coordinator_report(&self, report: &CoordinatorReport) -> Result<()> {
        self.check()?;
        self.lock().reports.push(report.clone());
        Ok(())
    }

    async fn get_coordinator_report(&self) -> Result<Option<CoordinatorReport>> {
        self.check()?;
        Ok(self.lock().reports.last().cloned())
    }
}

impl Heartbeats for MemoryStore {
    async fn heartbeat(&self, component: &str, instance: &str, _ttl: Duration) -> Result<()> {
        self.check()?;
        self.lock()
            .heartbeats
            .insert((component.to_string(), instance.to_string()));
        Ok(())
    }

    async fn is_alive(&self, component: &str, instance: &str) -> Result<bool> {
        self.check()?;
        Ok(self
            .lock()
            .heartbeats
            .contains(&(component.to_string(), instance.to_string())))
    }
}

// ── Step methods ──────────────────────────────────────────────────────────────

pub type StepLog = Arc<Mutex<Vec<String>>>;

/// Logs `start`/`end` per job and sleeps in between; optionally fails.
pub struct RecordingStep {
    pub name: &'static str,
    pub effect: EffectClass,
    pub log: StepLog,
    pub delay: Duration,
    pub fail: bool,
    pub shared: Option<&'static str>,
}

impl RecordingStep {
    pub fn new(name: &'static str, effect: EffectClass, log: &StepLog) -> Self {
        Self {
            name,
            effect,
            log: Arc::clone(log),
            delay: Duration::from_millis(100),
            fail: false,
            shared: None,
        }
    }

    #[must_use]
    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    #[must_use]
    pub fn taking(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Name a host-wide lock, as methods editing shared files do.
    #[must_use]
    pub fn sharing(mut self, key: &'static str) -> Self {
        self.shared = Some(key);
        self
    }
}

#[async_trait(?Send)]
impl StepMethod for RecordingStep {
    fn name(&self) -> &'static str {
        self.name
    }

    fn effect(&self) -> EffectClass {
        self.effect
    }

    fn shared_lock(&self) -> Option<&'static str> {
        self.shared
    }

    async fn execute(&self, ctx: &StepContext<'_>, _args: &Value) -> Result<Option<String>, StepError> {
        self.log
            .lock()
            .unwrap()
            .push(format!("start {} {} {}", ctx.resource_id, ctx.job_id, self.name));
        tokio::time::sleep(self.delay).await;
        self.log
            .lock()
            .unwrap()
            .push(format!("end {} {} {}", ctx.resource_id, ctx.job_id, self.name));
        if self.fail {
            return Err(StepError::Command(format!("{} exploded", self.name)));
        }
        Ok(Some(format!("{} done", self.name)))
    }
}

/// `true` when runs of the step named `step` never overlapped, whatever
/// resource their jobs targeted.
pub fn step_never_overlapped(log: &[String], step: &str) -> bool {
    let mut running = 0;
    for entry in log {
        let parts: Vec<&str> = entry.split(' ').collect();
        if parts[3] != step {
            continue;
        }
        match parts[0] {
            "start" => {
                running += 1;
                if running > 1 {
                    return false;
                }
            }
            _ => running -= 1,
        }
    }
    true
}

/// `true` when no two jobs ever had steps in flight on the same resource.
pub fn serialized_per_resource(log: &[String]) -> bool {
    let mut active: HashMap<String, String> = HashMap::new();
    for entry in log {
        let parts: Vec<&str> = entry.split(' ').collect();
        let (kind, resource, job) = (parts[0], parts[1], parts[2]);
        match kind {
            "start" => {
                if let Some(holder) = active.get(resource)
                    && holder != job
                {
                    return false;
                }
                active.insert(resource.to_string(), job.to_string());
            }
            _ => {
                active.remove(resource);
            }
        }
    }
    true
}

// ── Proxy fakes ───────────────────────────────────────────────────────────────

#[derive(Default)]
struct ProxyInner {
    live: Option<String>,
    candidate: Option<String>,
    backup: Option<String>,
    /// Scripted validation results; once empty, validation passes.
    validations: VecDeque<Validation>,
    drains: VecDeque<DrainStatus>,
    fail_activation: bool,
    validated: usize,
    activated: usize,
    restored: usize,
}

/// nginx stand-in keeping the live/candidate/backup files in memory.
#[derive(Default)]
pub struct FakeProxy {
    inner: Mutex<ProxyInner>,
}

impl FakeProxy {
    pub fn with_live(text: &str) -> Self {
        let proxy = Self::default();
        proxy.inner.lock().unwrap().live = Some(text.to_string());
        proxy
    }

    pub fn reject_next(&self, output: &str) {
        self.inner.lock().unwrap().validations.push_back(Validation {
            ok: false,
            output: output.to_string(),
        });
    }

    pub fn drain_next(&self, status: DrainStatus) {
        self.inner.lock().unwrap().drains.push_back(status);
    }

    pub fn fail_activation(&self) {
        self.inner.lock().unwrap().fail_activation = true;
    }

    pub fn live(&self) -> Option<String> {
        self.inner.lock().unwrap().live.clone()
    }

    pub fn validated(&self) -> usize {
        self.inner.lock().unwrap().validated
    }

    pub fn activated(&self) -> usize {
        self.inner.lock().unwrap().activated
    }

    pub fn restored(&self) -> usize {
        self.inner.lock().unwrap().restored
    }
}

impl ProxyDriver for FakeProxy {
    async fn write_candidate(&self, text: &str) -> Result<()> {
        self.inner.lock().unwrap().candidate = Some(text.to_string());
        Ok(())
    }

    async fn validate_candidate(&self) -> Result<Validation> {
        let mut inner = self.inner.lock().unwrap();
        inner.validated += 1;
        Ok(inner.validations.pop_front().unwrap_or(Validation {
            ok: true,
            output: String::new(),
        }))
    }

    async fn activate_candidate(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.backup = inner.live.clone();
        inner.live = inner.candidate.take();
        if inner.fail_activation {
            anyhow::bail!("nginx: [emerg] bind() failed");
        }
        inner.activated += 1;
        Ok(())
    }

    async fn restore_last_good(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.live = inner.backup.clone();
        inner.restored += 1;
        Ok(())
    }

    async fn live_config(&self) -> Result<Option<String>> {
        Ok(self.live())
    }

    async fn drain_status(&self) -> Result<DrainStatus> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .drains
            .pop_front()
            .unwrap_or(DrainStatus {
                active: 4,
                draining: 0,
            }))
    }
}

/// Host state source returning a fixed state; counts prune calls.
#[derive(Default)]
pub struct FakeHosts {
    pub state: HostState,
    pub prune_result: usize,
    pub pruned: Mutex<Vec<String>>,
}

impl HostStateSource for FakeHosts {
    async fn load_host_state(&self) -> Result<HostState> {
        Ok(self.state.clone())
    }

    async fn prune_conflicting(&self, domain: &str) -> Result<usize> {
        self.pruned.lock().unwrap().push(domain.to_string());
        Ok(self.prune_result)
    }
}

pub struct FakeHealth {
    pub healthy: bool,
}

impl HealthProbe for FakeHealth {
    async fn probe(&self) -> Result<()> {
        if self.healthy {
            Ok(())
        } else {
            anyhow::bail!("health check returned 502")
        }
    }
}
