//! Tests for the stale-job sweep.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use press_agent::application::ports::Heartbeats;
use press_agent::application::services::sweep::sweep_stale;
use press_common::{JobStatus, Priority, StatusRecord};

use crate::mocks::{MemoryStore, job};

const STALE_AFTER: Duration = Duration::from_secs(600);

fn running_record(id: &str, worker: &str, minutes_ago: i64) -> StatusRecord {
    let payload = job(id, Priority::Default, "site-a", &[("p", "prepare")]);
    let mut record = StatusRecord::queued(&payload, Utc::now());
    record.status = JobStatus::Running;
    record.worker = Some(worker.to_string());
    record.started_at = Some(Utc::now() - ChronoDuration::minutes(minutes_ago));
    record
}

#[tokio::test]
async fn test_sweep_requeues_job_of_dead_worker() {
    let store = MemoryStore::new();
    store.put_job(&job("j-stale", Priority::Default, "site-a", &[("p", "prepare")]));
    store.force_running(running_record("j-stale", "w-dead", 30));
    store.hold_lock("site-a", "j-stale");

    let report = sweep_stale(&store, STALE_AFTER, Utc::now()).await.unwrap();

    assert_eq!(report.requeued, vec!["j-stale".to_string()]);
    assert_eq!(store.state("j-stale"), Some(JobStatus::Queued));
    assert_eq!(store.queue(Priority::Default), vec!["j-stale".to_string()]);
    assert!(store.status("j-stale").unwrap().worker.is_none());
    assert_eq!(store.lock_log(), vec!["release site-a j-stale".to_string()]);
}

#[tokio::test]
async fn test_sweep_leaves_long_job_of_live_worker() {
    let store = MemoryStore::new();
    store.put_job(&job("j-long", Priority::Default, "site-a", &[("p", "prepare")]));
    store.force_running(running_record("j-long", "w-live", 30));
    store
        .heartbeat("worker", "w-live", Duration::from_secs(15))
        .await
        .unwrap();

    let report = sweep_stale(&store, STALE_AFTER, Utc::now()).await.unwrap();

    assert!(report.requeued.is_empty());
    assert_eq!(report.healthy, 1);
    assert_eq!(store.state("j-long"), Some(JobStatus::Running));
}

#[tokio::test]
async fn test_sweep_ignores_fresh_jobs_and_reports_orphans() {
    let store = MemoryStore::new();
    store.put_job(&job("j-fresh", Priority::Default, "site-a", &[("p", "prepare")]));
    store.force_running(running_record("j-fresh", "w-dead", 1));
    store.force_running(running_record("j-orphan", "w-dead", 30));

    let report = sweep_stale(&store, STALE_AFTER, Utc::now()).await.unwrap();

    assert_eq!(report.healthy, 1);
    assert_eq!(report.orphaned, vec!["j-orphan".to_string()]);
    assert!(report.requeued.is_empty());
}
