//! Valkey implementation of the shared queue store ports.
//!
//! Two connections are kept: `client` for ordinary commands and `blocking`
//! for `BLPOP`/`BRPOPLPUSH`, so a long poll never delays status writes.

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use fred::prelude::*;
use futures::Stream;
use press_common::{
    CoordinatorReport, JobPayload, JobStatus, Priority, ReloadRequest, ReloadStatus, StatusRecord,
    heartbeat_key, job_key, keys, lock_key, queue_key, reload_status_key, state_key, status_key,
    ttl,
};

use crate::application::ports::{
    ClaimOutcome, Heartbeats, JobQueue, ReloadChannel, ResourceLocks, StatusStore,
};
use crate::domain::AgentConfig;

// ── Lua scripts ───────────────────────────────────────────────────────────────

/// KEYS: job, state, status, queue. ARGV: payload, record, job id.
/// A known id is only pushed again (duplicate delivery); its state is kept.
const ENQUEUE_SCRIPT: &str = r"
local current = redis.call('GET', KEYS[2])
if current == false then
  redis.call('SET', KEYS[1], ARGV[1])
  redis.call('SET', KEYS[2], 'queued')
  redis.call('SET', KEYS[3], ARGV[2])
end
redis.call('RPUSH', KEYS[4], ARGV[3])
return current or 'new'
";

/// KEYS: job, state, status, queue, running set. ARGV: payload, record, job id.
const REQUEUE_SCRIPT: &str = r"
redis.call('SET', KEYS[1], ARGV[1])
redis.call('SET', KEYS[2], 'queued')
redis.call('SET', KEYS[3], ARGV[2])
redis.call('SREM', KEYS[5], ARGV[3])
redis.call('RPUSH', KEYS[4], ARGV[3])
return 1
";

/// KEYS: state, running set. ARGV: job id.
const CLAIM_SCRIPT: &str = r"
local current = redis.call('GET', KEYS[1])
if current == false or current == 'queued' then
  redis.call('SET', KEYS[1], 'running')
  redis.call('SADD', KEYS[2], ARGV[1])
  return 'claimed'
end
return current
";

/// KEYS: state. Only a job still `queued` can be cancelled.
const CANCEL_SCRIPT: &str = r"
if redis.call('GET', KEYS[1]) == 'queued' then
  redis.call('SET', KEYS[1], 'cancelled')
  return 1
end
return 0
";

/// KEYS: state, status, running set, job. ARGV: status, record, job id, ttl (0 = keep).
const SET_STATUS_SCRIPT: &str = r"
if ARGV[4] ~= '0' then
  redis.call('SET', KEYS[1], ARGV[1], 'EX', ARGV[4])
  redis.call('SET', KEYS[2], ARGV[2], 'EX', ARGV[4])
  redis.call('EXPIRE', KEYS[4], ARGV[4])
else
  redis.call('SET', KEYS[1], ARGV[1])
  redis.call('SET', KEYS[2], ARGV[2])
end
if ARGV[1] == 'running' then
  redis.call('SADD', KEYS[3], ARGV[3])
else
  redis.call('SREM', KEYS[3], ARGV[3])
end
return 1
";

/// KEYS: lock. ARGV: job id, ttl ms. Re-entrant for the holder.
const ACQUIRE_LOCK_SCRIPT: &str = r"
local holder = redis.call('GET', KEYS[1])
if holder == false or holder == ARGV[1] then
  redis.call('SET', KEYS[1], ARGV[1], 'PX', ARGV[2])
  return 1
end
return 0
";

/// KEYS: lock. ARGV: job id, ttl ms. Only the holder may extend it.
const RENEW_LOCK_SCRIPT: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
";

/// KEYS: lock. ARGV: job id. Never deletes another job's lock.
const RELEASE_LOCK_SCRIPT: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
";

// ── Store ─────────────────────────────────────────────────────────────────────

pub struct ValkeyStore {
    client: Client,
    blocking: Client,
}

impl ValkeyStore {
    /// Connect both clients and verify with `PING`.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid, the password file cannot be
    /// read, or the server does not answer.
    pub async fn connect(config: &AgentConfig) -> Result<Self> {
        let mut fred_config = Config::from_url(&config.valkey_url)
            .with_context(|| format!("invalid Valkey URL {}", config.valkey_url))?;
        if let Some(user) = &config.valkey_user {
            fred_config.username = Some(user.clone());
        }
        if let Some(path) = &config.valkey_pass_file {
            let password = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("reading Valkey password file {path}"))?;
            fred_config.password = Some(password.trim().to_string());
        }

        let mut builder = Builder::from_config(fred_config);
        builder
            .with_connection_config(|conn_config| {
                conn_config.connection_timeout = Duration::from_secs(5);
                conn_config.internal_command_timeout = Duration::from_secs(10);
            })
            .set_policy(ReconnectPolicy::new_exponential(0, 100, 5000, 5));
        let client = builder.build()?;
        let blocking = builder.build()?;

        client.init().await.context("connecting to Valkey")?;
        blocking.init().await.context("connecting to Valkey (blocking)")?;
        client
            .ping::<String>(None)
            .await
            .context("Valkey startup PING failed")?;

        tracing::info!(url = %config.valkey_url, "Valkey connection ready");
        Ok(Self { client, blocking })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let raw: Option<String> = self.client.get(key).await?;
        raw.map(|json| serde_json::from_str(&json).with_context(|| format!("parsing {key}")))
            .transpose()
    }
}

fn seconds(duration: Duration) -> f64 {
    duration.as_secs_f64().max(0.1)
}

fn ttl_secs(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn parse_reload(raw: &str) -> ReloadRequest {
    serde_json::from_str(raw).unwrap_or_else(|e| {
        // Still counts as a change signal; the render is total anyway.
        tracing::warn!(error = %e, "malformed reload request, treating as anonymous");
        ReloadRequest {
            resource_id: "unknown".to_string(),
            emitted_at: Utc::now(),
            job_id: None,
        }
    })
}

impl JobQueue for ValkeyStore {
    async fn enqueue(&self, job: &JobPayload) -> Result<()> {
        let payload = serde_json::to_string(job)?;
        let record = serde_json::to_string(&StatusRecord::queued(job, Utc::now()))?;
        let previous: String = self
            .client
            .eval(
                ENQUEUE_SCRIPT,
                vec![
                    job_key(&job.id),
                    state_key(&job.id),
                    status_key(&job.id),
                    queue_key(job.priority),
                ],
                vec![payload, record, job.id.clone()],
            )
            .await
            .context("enqueue script failed")?;
        tracing::info!(job_id = %job.id, priority = %job.priority, state = %previous, "job enqueued");
        Ok(())
    }

    async fn requeue(&self, job: &JobPayload, record: &StatusRecord) -> Result<()> {
        let payload = serde_json::to_string(job)?;
        let record = serde_json::to_string(record)?;
        let _: i64 = self
            .client
            .eval(
                REQUEUE_SCRIPT,
                vec![
                    job_key(&job.id),
                    state_key(&job.id),
                    status_key(&job.id),
                    queue_key(job.priority),
                    keys::RUNNING.to_string(),
                ],
                vec![payload, record, job.id.clone()],
            )
            .await
            .context("requeue script failed")?;
        Ok(())
    }

    async fn dequeue(&self, priorities: &[Priority], timeout: Duration) -> Result<Option<String>> {
        let queue_keys: Vec<String> = priorities.iter().map(|p| queue_key(*p)).collect();
        let value: Value = self
            .blocking
            .blpop(queue_keys, seconds(timeout))
            .await
            .context("BLPOP failed")?;
        if value.is_null() {
            return Ok(None);
        }
        let (_queue, job_id): (String, String) = value.convert()?;
        Ok(Some(job_id))
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<JobPayload>> {
        let raw: Option<String> = self.client.get(job_key(job_id)).await?;
        let Some(json) = raw else {
            return Ok(None);
        };
        match serde_json::from_str(&json) {
            Ok(job) => Ok(Some(job)),
            Err(e) => {
                tracing::error!(%job_id, error = %e, "unparseable job payload, dropping");
                Ok(None)
            }
        }
    }
}

impl StatusStore for ValkeyStore {
    async fn claim(&self, job_id: &str) -> Result<ClaimOutcome> {
        let result: String = self
            .client
            .eval(
                CLAIM_SCRIPT,
                vec![state_key(job_id), keys::RUNNING.to_string()],
                vec![job_id.to_string()],
            )
            .await
            .context("claim script failed")?;
        Ok(match result.as_str() {
            "claimed" => ClaimOutcome::Claimed,
            "running" => ClaimOutcome::InFlight,
            other => match other.parse::<JobStatus>() {
                Ok(status) if status.is_terminal() => ClaimOutcome::Terminal(status),
                _ => anyhow::bail!("unexpected state '{other}' for job {job_id}"),
            },
        })
    }

    async fn cancel(&self, job_id: &str) -> Result<bool> {
        let cancelled: i64 = self
            .client
            .eval(CANCEL_SCRIPT, vec![state_key(job_id)], Vec::<String>::new())
            .await
            .context("cancel script failed")?;
        Ok(cancelled == 1)
    }

    async fn get_status(&self, job_id: &str) -> Result<Option<StatusRecord>> {
        self.get_json(&status_key(job_id)).await
    }

    async fn set_status(&self, record: &StatusRecord) -> Result<()> {
        let expiry = if record.status.is_terminal() {
            ttl::TERMINAL_RECORD_SECS
        } else {
            0
        };
        let _: i64 = self
            .client
            .eval(
                SET_STATUS_SCRIPT,
                vec![
                    state_key(&record.id),
                    status_key(&record.id),
                    keys::RUNNING.to_string(),
                    job_key(&record.id),
                ],
                vec![
                    record.status.as_str().to_string(),
                    serde_json::to_string(record)?,
                    record.id.clone(),
                    expiry.to_string(),
                ],
            )
            .await
            .context("status script failed")?;
        Ok(())
    }

    async fn running_jobs(&self) -> Result<Vec<String>> {
        let mut ids: Vec<String> = self.client.smembers(keys::RUNNING).await?;
        ids.sort();
        Ok(ids)
    }
}

impl ResourceLocks for ValkeyStore {
    async fn acquire_lock(&self, resource_id: &str, job_id: &str, ttl: Duration) -> Result<bool> {
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
        let acquired: i64 = self
            .client
            .eval(
                ACQUIRE_LOCK_SCRIPT,
                vec![lock_key(resource_id)],
                vec![job_id.to_string(), ttl_ms.to_string()],
            )
            .await
            .context("lock script failed")?;
        Ok(acquired == 1)
    }

    async fn renew_lock(&self, resource_id: &str, job_id: &str, ttl: Duration) -> Result<bool> {
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
        let renewed: i64 = self
            .client
            .eval(
                RENEW_LOCK_SCRIPT,
                vec![lock_key(resource_id)],
                vec![job_id.to_string(), ttl_ms.to_string()],
            )
            .await
            .context("lock renew script failed")?;
        Ok(renewed == 1)
    }

    async fn release_lock(&self, resource_id: &str, job_id: &str) -> Result<bool> {
        let released: i64 = self
            .client
            .eval(
                RELEASE_LOCK_SCRIPT,
                vec![lock_key(resource_id)],
                vec![job_id.to_string()],
            )
            .await
            .context("unlock script failed")?;
        Ok(released == 1)
    }

    async fn lock_holder(&self, resource_id: &str) -> Result<Option<String>> {
        Ok(self.client.get(lock_key(resource_id)).await?)
    }
}

impl ReloadChannel for ValkeyStore {
    async fn publish_reload(&self, request: &ReloadRequest) -> Result<()> {
        let json = serde_json::to_string(request)?;
        let _: i64 = self
            .client
            .lpush(keys::RELOAD_PENDING, json)
            .await
            .context("publishing reload request")?;
        Ok(())
    }

    fn subscribe_reloads(
        &self,
        poll_timeout: Duration,
    ) -> impl Stream<Item = Result<ReloadRequest>> + '_ {
        async_stream::stream! {
            // Redeliver what a previous subscriber took but never acknowledged.
            let backlog = loop {
                match self.client.lrange::<Vec<String>, _>(keys::RELOAD_PROCESSING, 0, -1).await {
                    Ok(items) => break items,
                    Err(e) => yield Err(anyhow::Error::new(e).context("reading reload backlog")),
                }
            };
            if !backlog.is_empty() {
                tracing::info!(count = backlog.len(), "redelivering unacknowledged reload requests");
            }
            for raw in backlog.iter().rev() {
                yield Ok(parse_reload(raw));
            }
            loop {
                let moved: Result<Option<String>, Error> = self
                    .blocking
                    .brpoplpush(keys::RELOAD_PENDING, keys::RELOAD_PROCESSING, seconds(poll_timeout))
                    .await;
                match moved {
                    Ok(Some(raw)) => yield Ok(parse_reload(&raw)),
                    Ok(None) => {}
                    Err(e) => yield Err(anyhow::Error::new(e).context("waiting for reload requests")),
                }
            }
        }
    }

    async fn ack_reloads(&self, count: usize) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        let count = i64::try_from(count).unwrap_or(i64::MAX - 1);
        let _: () = self
            .client
            .ltrim(keys::RELOAD_PROCESSING, 0, -count - 1)
            .await
            .context("acknowledging reload requests")?;
        Ok(())
    }

    async fn set_reload_status(&self, job_id: &str, status: ReloadStatus) -> Result<()> {
        let _: () = self
            .client
            .set(
                reload_status_key(job_id),
                status.as_str(),
                Some(Expiration::EX(ttl_secs(ttl::RELOAD_STATUS_SECS))),
                None,
                false,
            )
            .await?;
        Ok(())
    }

    async fn get_reload_status(&self, job_id: &str) -> Result<Option<ReloadStatus>> {
        let raw: Option<String> = self.client.get(reload_status_key(job_id)).await?;
        raw.map(|s| {
            serde_json::from_value(serde_json::Value::String(s))
                .context("parsing reload status")
        })
        .transpose()
    }

    async fn set_coordinator_report(&self, report: &CoordinatorReport) -> Result<()> {
        let json = serde_json::to_string(report)?;
        let _: () = self
            .client
            .set(keys::RELOAD_STATE, json, None, None, false)
            .await?;
        Ok(())
    }

    async fn get_coordinator_report(&self) -> Result<Option<CoordinatorReport>> {
        self.get_json(keys::RELOAD_STATE).await
    }
}

impl Heartbeats for ValkeyStore {
    async fn heartbeat(&self, component: &str, instance: &str, ttl: Duration) -> Result<()> {
        let _: () = self
            .client
            .set(
                heartbeat_key(component, instance),
                Utc::now().to_rfc3339(),
                Some(Expiration::EX(ttl_secs(ttl.as_secs().max(1)))),
                None,
                false,
            )
            .await?;
        Ok(())
    }

    async fn is_alive(&self, component: &str, instance: &str) -> Result<bool> {
        Ok(self.client.exists(heartbeat_key(component, instance)).await?)
    }
}
