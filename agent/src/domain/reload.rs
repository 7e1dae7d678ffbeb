//! Reload coordinator timing rules: sliding debounce with a ceiling, swap
//! rate limiting, the mandatory-reload interval, and the nginx drain gate.
//!
//! Everything here takes `now` as an argument; the coordinator feeds it from
//! tokio's clock so tests can run on a paused clock.

use std::collections::BTreeSet;
use std::sync::LazyLock;
use std::time::{Duration, Instant};

use press_common::ReloadRequest;
use regex::Regex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebounceSettings {
    /// Quiet period after the most recent request.
    pub window: Duration,
    /// Upper bound measured from the first request of the batch.
    pub ceiling: Duration,
}

// ── Debouncer ────────────────────────────────────────────────────────────────

/// Collects reload requests into one batch.
#[derive(Debug, Clone)]
pub struct Debouncer {
    settings: DebounceSettings,
    first_at: Option<Instant>,
    last_at: Option<Instant>,
    requests: Vec<ReloadRequest>,
    resources: BTreeSet<String>,
}

/// A batch handed to one render/validate/swap cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    /// Raw requests in delivery order, duplicates included (for acknowledgement).
    pub requests: Vec<ReloadRequest>,
    /// Distinct resource ids named by the batch.
    pub resources: BTreeSet<String>,
}

impl Batch {
    /// Distinct job ids that asked for this reload.
    pub fn job_ids(&self) -> BTreeSet<&str> {
        self.requests
            .iter()
            .filter_map(|r| r.job_id.as_deref())
            .collect()
    }
}

impl Debouncer {
    pub fn new(settings: DebounceSettings) -> Self {
        Self {
            settings,
            first_at: None,
            last_at: None,
            requests: Vec::new(),
            resources: BTreeSet::new(),
        }
    }

    /// Add a request. Returns `true` when it opened a new batch.
    pub fn record(&mut self, request: ReloadRequest, now: Instant) -> bool {
        let opened = self.first_at.is_none();
        if opened {
            self.first_at = Some(now);
        }
        self.last_at = Some(now);
        self.resources.insert(request.resource_id.clone());
        self.requests.push(request);
        opened
    }

    /// When the batch becomes due: `min(last + window, first + ceiling)`.
    pub fn due_at(&self) -> Option<Instant> {
        let first = self.first_at?;
        let last = self.last_at?;
        Some((last + self.settings.window).min(first + self.settings.ceiling))
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.due_at().is_some_and(|due| now >= due)
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Raw requests delivered so far (the acknowledgement count).
    pub fn delivered(&self) -> usize {
        self.requests.len()
    }

    pub fn pending_resources(&self) -> usize {
        self.resources.len()
    }

    /// Keep the batch but restart its timers (used when a swap is postponed).
    pub fn postpone(&mut self, now: Instant) {
        if !self.is_empty() {
            self.first_at = Some(now);
            self.last_at = Some(now);
        }
    }

    pub fn take(&mut self) -> Batch {
        self.first_at = None;
        self.last_at = None;
        Batch {
            requests: std::mem::take(&mut self.requests),
            resources: std::mem::take(&mut self.resources),
        }
    }
}

// ── Scheduling ───────────────────────────────────────────────────────────────

/// Earliest instant a swap may run given the rate limit.
pub fn next_swap_allowed(last_swap: Option<Instant>, min_interval: Duration) -> Option<Instant> {
    last_swap.map(|at| at + min_interval)
}

/// Instant at which a cycle must run even without requests.
pub fn mandatory_reload_at(last_reload: Instant, max_interval: Duration) -> Option<Instant> {
    if max_interval.is_zero() {
        None
    } else {
        Some(last_reload + max_interval)
    }
}

// ── Drain gate ───────────────────────────────────────────────────────────────

/// Worker process counts parsed from the proxy's service status output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainStatus {
    pub active: usize,
    pub draining: usize,
}

const WORKER_MARKER: &str = "nginx: worker process";
const MASTER_MARKER: &str = "nginx: master process";
const DRAINING_MARKER: &str = "nginx: worker process is shutting down";

impl DrainStatus {
    pub fn parse(status_output: &str) -> Self {
        let total = status_output.matches(WORKER_MARKER).count()
            + status_output.matches(MASTER_MARKER).count();
        let draining = status_output.matches(DRAINING_MARKER).count();
        Self {
            active: total.saturating_sub(draining).max(1),
            draining,
        }
    }

    /// Too many workers still draining old connections to reload again.
    pub fn should_postpone(&self, max_draining: usize) -> bool {
        self.draining >= self.active || self.draining >= max_draining
    }
}

// ── Validation output ────────────────────────────────────────────────────────

static CONFLICTING_PARAMETER: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r#"conflicting parameter "(.*?)""#).ok());

/// Domain named by an nginx `conflicting parameter` validation error.
pub fn find_conflicting_domain(validation_output: &str) -> Option<String> {
    let re = CONFLICTING_PARAMETER.as_ref()?;
    re.captures(validation_output)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .filter(|domain| !domain.is_empty())
}
