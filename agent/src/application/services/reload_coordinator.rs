//! Application service — the reload coordinator.
//!
//! Single writer of the proxy configuration. Reload requests are debounced
//! into batches; each batch runs one cycle:
//!
//! ```text
//! idle → collecting → rendering → validating → swapping → idle
//!                                      ↘ failed-validation → idle
//! ```
//!
//! Rendering is always total (from the host directories, not the requests).
//! The live file only ever changes through `activate_candidate` after a
//! successful validation, and any activation failure restores the backup.

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use futures::StreamExt;
use press_common::{CoordinatorReport, CoordinatorState, CycleOutcome, ReloadStatus};
use tokio_util::sync::CancellationToken;

use crate::application::ports::{HealthProbe, HostStateSource, ProxyDriver, SharedStore, Validation};
use crate::application::services::retry::{now, with_store_retry};
use crate::domain::proxy_config::{self, RenderSettings};
use crate::domain::reload::{find_conflicting_domain, mandatory_reload_at, next_swap_allowed};
use crate::domain::{Backoff, BackoffStep, Batch, CoordinatorSettings, Debouncer};

pub const COMPONENT: &str = "reload";

/// Upper bound on a single sleep when nothing is scheduled.
const IDLE_WAKE: Duration = Duration::from_secs(3600);

pub struct ReloadCoordinator<'a, S, H, P, Q> {
    store: &'a S,
    hosts: &'a H,
    proxy: &'a P,
    health: &'a Q,
    render_settings: RenderSettings,
    settings: CoordinatorSettings,
    report: CoordinatorReport,
}

impl<'a, S, H, P, Q> ReloadCoordinator<'a, S, H, P, Q>
where
    S: SharedStore,
    H: HostStateSource,
    P: ProxyDriver,
    Q: HealthProbe,
{
    pub fn new(
        store: &'a S,
        hosts: &'a H,
        proxy: &'a P,
        health: &'a Q,
        render_settings: RenderSettings,
        settings: CoordinatorSettings,
    ) -> Self {
        Self {
            store,
            hosts,
            proxy,
            health,
            render_settings,
            settings,
            report: CoordinatorReport::default(),
        }
    }

    pub fn report(&self) -> &CoordinatorReport {
        &self.report
    }

    /// Run until `shutdown` is cancelled. A cycle in progress is completed
    /// first; its requests are acknowledged before returning.
    ///
    /// # Errors
    ///
    /// Returns an error when the store stays unreachable past the retry
    /// policy, or the subscription ends.
    pub async fn run(mut self, shutdown: &CancellationToken, heartbeat_ttl: Duration) -> Result<()> {
        let store = self.store;
        let stream = store.subscribe_reloads(self.settings.poll_timeout);
        tokio::pin!(stream);

        let mut debouncer = Debouncer::new(self.settings.debounce);
        let mut backoff = Backoff::new(self.settings.store_retry);
        let started = now();
        let mut last_cycle: Option<Instant> = None;
        let mut last_reload: Option<Instant> = None;
        let mut retry_at: Option<Instant> = None;
        let mut next_beat = started;

        tracing::info!(instance = %self.settings.instance, "reload coordinator started");
        self.enter(CoordinatorState::Idle, 0).await;

        loop {
            if now() >= next_beat {
                self.beat(heartbeat_ttl).await;
                next_beat = now() + self.settings.heartbeat_interval;
            }

            let wake = self.next_wake(&debouncer, last_reload.unwrap_or(started), last_cycle, retry_at);
            let deadline = wake.unwrap_or_else(|| now() + IDLE_WAKE).min(next_beat);

            tokio::select! {
                // Timer before stream so the debounce ceiling holds under load.
                biased;
                () = shutdown.cancelled() => break,
                () = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => {
                    if wake.is_none_or(|at| now() < at) {
                        continue;
                    }
                    if self.drain_blocks_swap().await {
                        let at = now();
                        debouncer.postpone(at);
                        retry_at = Some(at + self.settings.debounce.window);
                        self.report.last_outcome = Some(CycleOutcome::Postponed);
                        let state = if debouncer.is_empty() {
                            CoordinatorState::Idle
                        } else {
                            CoordinatorState::Collecting
                        };
                        self.enter(state, debouncer.pending_resources()).await;
                        continue;
                    }
                    retry_at = None;
                    let batch = debouncer.take();
                    if batch.requests.is_empty() {
                        tracing::info!("no reload within the mandatory interval, forcing one");
                    }
                    let outcome = self.run_cycle(&batch).await;
                    last_cycle = Some(now());
                    if outcome == CycleOutcome::Activated {
                        last_reload = last_cycle;
                    }
                    self.finish(&batch, outcome).await?;
                }
                item = stream.next() => match item {
                    Some(Ok(request)) => {
                        backoff.on_success();
                        tracing::debug!(resource_id = %request.resource_id, job_id = ?request.job_id, "reload requested");
                        if debouncer.record(request, now()) {
                            self.enter(CoordinatorState::Collecting, debouncer.pending_resources()).await;
                        } else {
                            self.report.pending_resources = debouncer.pending_resources();
                        }
                    }
                    Some(Err(e)) => match backoff.on_failure(now()) {
                        BackoffStep::Retry(delay) => {
                            tracing::warn!(error = %format!("{e:#}"), delay_ms = delay.as_millis(), "reload subscription failed, backing off");
                            tokio::select! {
                                () = tokio::time::sleep(delay) => {}
                                () = shutdown.cancelled() => {}
                            }
                            if self.beat(heartbeat_ttl).await {
                                backoff.on_success();
                            }
                        }
                        BackoffStep::Unhealthy { failing_for } => {
                            tracing::error!(failing_secs = failing_for.as_secs(), "store unavailable, coordinator unhealthy");
                            return Err(e.context("reload channel unavailable"));
                        }
                    },
                    None => anyhow::bail!("reload subscription ended"),
                },
            }
        }

        tracing::info!(pending = debouncer.delivered(), "reload coordinator stopped");
        Ok(())
    }

    /// One render/validate/swap cycle. Never fails: every failure ends in
    /// `failed-validation` with last-known-good still live.
    pub async fn run_cycle(&mut self, batch: &Batch) -> CycleOutcome {
        let pending = batch.resources.len();
        tracing::info!(resources = pending, requests = batch.requests.len(), "reload cycle started");

        if let Err(e) = self.render_and_check(pending).await.and_then(|v| {
            if v.ok {
                Ok(())
            } else {
                Err(anyhow::anyhow!("proxy rejected candidate: {}", v.output.trim()))
            }
        }) {
            tracing::error!(error = %format!("{e:#}"), "candidate configuration rejected, keeping live configuration");
            return self.fail(CycleOutcome::ValidationFailed, &e, pending).await;
        }

        self.enter(CoordinatorState::Swapping, pending).await;
        let activated = match self.proxy.activate_candidate().await {
            Ok(()) => self.health.probe().await.context("post-reload health probe"),
            Err(e) => Err(e),
        };
        if let Err(e) = activated {
            tracing::error!(error = %format!("{e:#}"), "activation failed, restoring last-known-good");
            if let Err(restore) = self.proxy.restore_last_good().await {
                tracing::error!(error = %format!("{restore:#}"), "restoring last-known-good failed");
            }
            return self.fail(CycleOutcome::ActivationFailed, &e, pending).await;
        }

        self.report.last_reload_at = Some(Utc::now());
        self.report.last_outcome = Some(CycleOutcome::Activated);
        self.report.last_error = None;
        self.enter(CoordinatorState::Idle, 0).await;
        tracing::info!(resources = pending, "proxy configuration activated");
        CycleOutcome::Activated
    }

    /// Render, write and validate the candidate, pruning duplicate site
    /// files once if the proxy names a conflicting domain.
    async fn render_and_check(&mut self, pending: usize) -> Result<Validation> {
        self.enter(CoordinatorState::Rendering, pending).await;
        self.render_candidate().await?;
        self.enter(CoordinatorState::Validating, pending).await;
        let validation = self.proxy.validate_candidate().await?;
        if validation.ok {
            return Ok(validation);
        }

        let Some(domain) = find_conflicting_domain(&validation.output) else {
            return Ok(validation);
        };
        let removed = self
            .hosts
            .prune_conflicting(&domain)
            .await
            .with_context(|| format!("pruning conflicting copies of {domain}"))?;
        if removed == 0 {
            return Ok(validation);
        }
        tracing::warn!(%domain, removed, "pruned conflicting site files, rendering again");

        self.enter(CoordinatorState::Rendering, pending).await;
        self.render_candidate().await?;
        self.enter(CoordinatorState::Validating, pending).await;
        self.proxy.validate_candidate().await
    }

    async fn render_candidate(&self) -> Result<()> {
        let state = self
            .hosts
            .load_host_state()
            .await
            .context("loading host state")?;
        let text = proxy_config::render(&state, &self.render_settings);
        self.proxy
            .write_candidate(&text)
            .await
            .context("writing candidate configuration")
    }

    async fn fail(
        &mut self,
        outcome: CycleOutcome,
        error: &anyhow::Error,
        pending: usize,
    ) -> CycleOutcome {
        self.report.last_outcome = Some(outcome);
        self.report.last_error = Some(format!("{error:#}"));
        self.enter(CoordinatorState::FailedValidation, pending).await;
        self.enter(CoordinatorState::Idle, 0).await;
        outcome
    }

    /// Acknowledge the batch and record each requesting job's reload outcome.
    async fn finish(&self, batch: &Batch, outcome: CycleOutcome) -> Result<()> {
        let store = self.store;
        let policy = self.settings.store_retry;
        let delivered = batch.requests.len();
        with_store_retry(policy, "ack reloads", move || store.ack_reloads(delivered)).await?;

        let status = if outcome == CycleOutcome::Activated {
            ReloadStatus::Success
        } else {
            ReloadStatus::Failure
        };
        for job_id in batch.job_ids() {
            with_store_retry(policy, "set reload status", move || {
                store.set_reload_status(job_id, status)
            })
            .await?;
        }
        Ok(())
    }

    fn next_wake(
        &self,
        debouncer: &Debouncer,
        last_reload: Instant,
        last_cycle: Option<Instant>,
        retry_at: Option<Instant>,
    ) -> Option<Instant> {
        let base = if debouncer.is_empty() {
            let due = mandatory_reload_at(last_reload, self.settings.max_interval_without_reload)?;
            // A forced cycle that failed is retried no faster than the debounce ceiling.
            let gap = self.settings.debounce.ceiling.max(self.settings.min_swap_interval);
            next_swap_allowed(last_cycle, gap).map_or(due, |at| due.max(at))
        } else {
            let due = debouncer.due_at()?;
            let allowed = next_swap_allowed(last_cycle, self.settings.min_swap_interval);
            allowed.map_or(due, |at| due.max(at))
        };
        Some(retry_at.map_or(base, |at| base.max(at)))
    }

    async fn drain_blocks_swap(&self) -> bool {
        match self.proxy.drain_status().await {
            Ok(drain) if drain.should_postpone(self.settings.max_draining_workers) => {
                tracing::info!(
                    active = drain.active,
                    draining = drain.draining,
                    "proxy workers still draining, postponing reload"
                );
                true
            }
            Ok(_) => false,
            Err(e) => {
                tracing::warn!(error = %format!("{e:#}"), "could not read proxy status, reloading anyway");
                false
            }
        }
    }

    async fn enter(&mut self, state: CoordinatorState, pending: usize) {
        self.report.state = state;
        self.report.pending_resources = pending;
        self.report.updated_at = Some(Utc::now());
        tracing::debug!(%state, pending, "coordinator state");
        if let Err(e) = self.store.set_coordinator_report(&self.report).await {
            tracing::warn!(error = %format!("{e:#}"), "publishing coordinator report failed");
        }
    }

    /// Refresh the liveness key; `true` when the store answered.
    async fn beat(&self, ttl: Duration) -> bool {
        match self
            .store
            .heartbeat(COMPONENT, &self.settings.instance, ttl)
            .await
        {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %format!("{e:#}"), "heartbeat failed");
                false
            }
        }
    }
}
