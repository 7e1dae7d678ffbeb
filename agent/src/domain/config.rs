//! Agent configuration schema and the per-component settings derived from it.
//!
//! Pure data and validation only — loading from the environment lives in
//! `crate::infra::config`.

use std::time::Duration;

use press_common::Priority;
use serde::{Deserialize, Serialize};

use crate::domain::backoff::BackoffPolicy;
use crate::domain::error::ConfigError;
use crate::domain::reload::DebounceSettings;

// ── Config schema ────────────────────────────────────────────────────────────

/// Agent configuration, read from `PRESS_AGENT_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentConfig {
    pub valkey_url: String,
    pub valkey_user: Option<String>,
    pub valkey_pass_file: Option<String>,

    pub bench_directory: String,
    pub nginx_directory: String,
    /// Default domain; hosts below it are removed together with their redirect.
    pub domain: Option<String>,
    pub tls_protocols: Option<String>,

    /// Priorities this worker serves. Dequeue order is always high > default > low.
    pub queues: Vec<String>,
    pub dequeue_timeout_secs: u64,
    pub lock_ttl_secs: u64,
    pub max_lock_attempts: u32,
    pub lock_retry_delay_ms: u64,

    pub store_backoff_initial_ms: u64,
    pub store_backoff_max_ms: u64,
    pub unhealthy_after_secs: u64,

    pub heartbeat_interval_secs: u64,
    pub stale_after_secs: u64,

    pub debounce_window_ms: u64,
    pub debounce_ceiling_ms: u64,
    pub max_reloads_per_minute: u32,
    pub max_interval_without_reload_secs: u64,
    pub max_draining_workers: usize,

    pub validate_command: String,
    pub reload_command: String,
    pub status_command: String,
    pub health_url: Option<String>,
    pub command_timeout_secs: u64,

    pub shutdown_grace_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            valkey_url: "redis://127.0.0.1:25025".to_string(),
            valkey_user: None,
            valkey_pass_file: None,
            bench_directory: "/home/frappe/benches".to_string(),
            nginx_directory: "/home/frappe/agent/nginx".to_string(),
            domain: None,
            tls_protocols: None,
            queues: Priority::ALL.iter().map(|p| p.as_str().to_string()).collect(),
            dequeue_timeout_secs: 5,
            lock_ttl_secs: 4 * 3600,
            max_lock_attempts: 30,
            lock_retry_delay_ms: 1000,
            store_backoff_initial_ms: 200,
            store_backoff_max_ms: 10_000,
            unhealthy_after_secs: 60,
            heartbeat_interval_secs: 10,
            stale_after_secs: 4 * 3600,
            debounce_window_ms: 2000,
            debounce_ceiling_ms: 10_000,
            max_reloads_per_minute: 30,
            max_interval_without_reload_secs: 600,
            max_draining_workers: 4,
            validate_command: "nginx -t -q -c {harness}".to_string(),
            reload_command: "sudo nginx -s reload".to_string(),
            status_command: "sudo systemctl status nginx".to_string(),
            health_url: None,
            command_timeout_secs: 60,
            shutdown_grace_secs: 30,
        }
    }
}

const MIN_LOCK_TTL_SECS: u64 = 3;

// ── Derived settings ─────────────────────────────────────────────────────────

/// Settings consumed by the job runner.
#[derive(Debug, Clone)]
pub struct RunnerSettings {
    /// `hostname-pid` of this worker, recorded on claimed jobs.
    pub instance: String,
    pub lock_ttl: Duration,
    pub max_lock_attempts: u32,
    pub store_retry: BackoffPolicy,
}

impl RunnerSettings {
    /// A held lock is extended this often, so two missed renewals still
    /// leave it alive.
    pub fn lock_renew_interval(&self) -> Duration {
        (self.lock_ttl / 3).max(Duration::from_millis(1))
    }
}

/// Settings consumed by the worker loop.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub priorities: Vec<Priority>,
    pub dequeue_timeout: Duration,
    pub lock_retry_delay: Duration,
    pub heartbeat_interval: Duration,
    pub runner: RunnerSettings,
}

/// Settings consumed by the reload coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub instance: String,
    pub debounce: DebounceSettings,
    /// Minimum spacing between two swaps (`60s / max_reloads_per_minute`).
    pub min_swap_interval: Duration,
    pub max_interval_without_reload: Duration,
    pub max_draining_workers: usize,
    pub poll_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub store_retry: BackoffPolicy,
}

impl AgentConfig {
    /// Reject invalid combinations before any component starts.
    ///
    /// # Errors
    ///
    /// Returns the first offending setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.priorities()?;
        if self.max_lock_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "max_lock_attempts",
                value: "0".to_string(),
                hint: "At least one lock attempt is required.",
            });
        }
        if self.lock_ttl_secs < MIN_LOCK_TTL_SECS {
            return Err(ConfigError::InvalidValue {
                key: "lock_ttl_secs",
                value: self.lock_ttl_secs.to_string(),
                hint: "The lock TTL must leave room for renewals (at least 3 seconds).",
            });
        }
        if self.lock_ttl_secs > self.stale_after_secs {
            return Err(ConfigError::InvalidValue {
                key: "lock_ttl_secs",
                value: self.lock_ttl_secs.to_string(),
                hint: "A dead worker's lock must expire before its job counts as stale (lock_ttl_secs <= stale_after_secs).",
            });
        }
        if self.debounce_window_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "debounce_window_ms",
                value: "0".to_string(),
                hint: "The debounce window must be positive.",
            });
        }
        if self.debounce_ceiling_ms < self.debounce_window_ms {
            return Err(ConfigError::InvalidValue {
                key: "debounce_ceiling_ms",
                value: self.debounce_ceiling_ms.to_string(),
                hint: "The debounce ceiling must not be shorter than the window.",
            });
        }
        if self.max_reloads_per_minute == 0 {
            return Err(ConfigError::InvalidValue {
                key: "max_reloads_per_minute",
                value: "0".to_string(),
                hint: "At least one reload per minute must be allowed.",
            });
        }
        if self.store_backoff_initial_ms == 0
            || self.store_backoff_max_ms < self.store_backoff_initial_ms
        {
            return Err(ConfigError::InvalidValue {
                key: "store_backoff_max_ms",
                value: self.store_backoff_max_ms.to_string(),
                hint: "Backoff must start above zero and cap at or above its initial delay.",
            });
        }
        for (key, command) in [
            ("validate_command", &self.validate_command),
            ("reload_command", &self.reload_command),
            ("status_command", &self.status_command),
        ] {
            if command_argv(command).is_empty() {
                return Err(ConfigError::InvalidValue {
                    key,
                    value: command.clone(),
                    hint: "Commands must not be empty.",
                });
            }
        }
        Ok(())
    }

    /// Served priorities in strict dequeue order, deduplicated.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown queue names or an empty list.
    pub fn priorities(&self) -> Result<Vec<Priority>, ConfigError> {
        let mut served = Vec::new();
        for name in self.queues.iter().map(|q| q.trim()).filter(|q| !q.is_empty()) {
            let priority: Priority = name.parse().map_err(|_| ConfigError::UnknownQueue {
                value: name.to_string(),
            })?;
            if !served.contains(&priority) {
                served.push(priority);
            }
        }
        if served.is_empty() {
            return Err(ConfigError::NoQueues);
        }
        served.sort();
        Ok(served)
    }

    pub fn store_retry(&self) -> BackoffPolicy {
        BackoffPolicy {
            initial: Duration::from_millis(self.store_backoff_initial_ms),
            max: Duration::from_millis(self.store_backoff_max_ms),
            give_up_after: Duration::from_secs(self.unhealthy_after_secs),
        }
    }

    pub fn runner_settings(&self, instance: &str) -> RunnerSettings {
        RunnerSettings {
            instance: instance.to_string(),
            lock_ttl: Duration::from_secs(self.lock_ttl_secs),
            max_lock_attempts: self.max_lock_attempts,
            store_retry: self.store_retry(),
        }
    }

    /// # Errors
    ///
    /// Returns an error if the served queues are invalid.
    pub fn worker_settings(&self, instance: &str) -> Result<WorkerSettings, ConfigError> {
        Ok(WorkerSettings {
            priorities: self.priorities()?,
            dequeue_timeout: Duration::from_secs(self.dequeue_timeout_secs.max(1)),
            lock_retry_delay: Duration::from_millis(self.lock_retry_delay_ms),
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs.max(1)),
            runner: self.runner_settings(instance),
        })
    }

    pub fn coordinator_settings(&self, instance: &str) -> CoordinatorSettings {
        let per_minute = u64::from(self.max_reloads_per_minute.max(1));
        CoordinatorSettings {
            instance: instance.to_string(),
            debounce: DebounceSettings {
                window: Duration::from_millis(self.debounce_window_ms),
                ceiling: Duration::from_millis(self.debounce_ceiling_ms),
            },
            min_swap_interval: Duration::from_millis(60_000 / per_minute),
            max_interval_without_reload: Duration::from_secs(
                self.max_interval_without_reload_secs,
            ),
            max_draining_workers: self.max_draining_workers,
            poll_timeout: Duration::from_secs(self.dequeue_timeout_secs.max(1)),
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs.max(1)),
            store_retry: self.store_retry(),
        }
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    /// Heartbeats expire after three missed beats.
    pub fn heartbeat_ttl(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1) * 3)
    }
}

/// Split a configured command line into argv, substituting `{name}` placeholders.
pub fn expand_command(command: &str, vars: &[(&str, &str)]) -> Vec<String> {
    command_argv(command)
        .into_iter()
        .map(|arg| {
            vars.iter().fold(arg, |acc, (name, value)| {
                acc.replace(&format!("{{{name}}}"), value)
            })
        })
        .collect()
}

fn command_argv(command: &str) -> Vec<String> {
    command.split_whitespace().map(str::to_string).collect()
}
