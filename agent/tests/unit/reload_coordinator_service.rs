//! Tests for the reload coordinator: debounce, validation failure, rollback,
//! drain gate, mandatory reloads, redelivery after a crash and store outages.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::collections::BTreeMap;
use std::time::Duration;

use press_agent::application::ports::ReloadChannel;
use press_agent::application::services::reload_coordinator::ReloadCoordinator;
use press_agent::domain::proxy_config::{HostState, RenderSettings, SiteRoute, SiteStatus, Upstream};
use press_agent::domain::reload::{DebounceSettings, DrainStatus};
use press_agent::domain::{Batch, CoordinatorSettings};
use press_common::{CoordinatorState, CycleOutcome, ReloadStatus};
use tokio_util::sync::CancellationToken;

use crate::mocks::{FakeHealth, FakeHosts, FakeProxy, MemoryStore, reload_request, retry_policy};

const HEARTBEAT_TTL: Duration = Duration::from_secs(15);

fn settings() -> CoordinatorSettings {
    CoordinatorSettings {
        instance: "c-1".to_string(),
        debounce: DebounceSettings {
            window: Duration::from_secs(2),
            ceiling: Duration::from_secs(10),
        },
        min_swap_interval: Duration::from_secs(2),
        max_interval_without_reload: Duration::ZERO,
        max_draining_workers: 4,
        poll_timeout: Duration::from_secs(1),
        heartbeat_interval: Duration::from_secs(5),
        store_retry: retry_policy(),
    }
}

fn render_settings() -> RenderSettings {
    RenderSettings {
        nginx_directory: "/etc/nginx".to_string(),
        tls_protocols: None,
    }
}

fn one_site_state() -> HostState {
    let mut upstreams = BTreeMap::new();
    upstreams.insert(
        "10.0.0.7".to_string(),
        Upstream {
            sites: vec![SiteRoute {
                name: "site-a.example.com".to_string(),
                status: SiteStatus::Active,
            }],
            secondaries: Vec::new(),
        },
    );
    HostState {
        hosts: BTreeMap::new(),
        upstreams,
    }
}

/// Run the coordinator on the paused clock for `duration`, then shut it down.
async fn run_for(
    store: &MemoryStore,
    hosts: &FakeHosts,
    proxy: &FakeProxy,
    health: &FakeHealth,
    settings: CoordinatorSettings,
    duration: Duration,
) {
    let token = CancellationToken::new();
    let coordinator = ReloadCoordinator::new(store, hosts, proxy, health, render_settings(), settings);
    let (result, ()) = tokio::join!(coordinator.run(&token, HEARTBEAT_TTL), async {
        tokio::time::sleep(duration).await;
        token.cancel();
    });
    result.unwrap();
}

// ============================================================================
// Debounce
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_burst_of_requests_yields_one_cycle() {
    let store = MemoryStore::new();
    for i in 0..5 {
        store
            .publish_reload(&reload_request("site-a", Some(&format!("j-{i}"))))
            .await
            .unwrap();
    }
    let (hosts, proxy, health) = (
        FakeHosts {
            state: one_site_state(),
            ..FakeHosts::default()
        },
        FakeProxy::default(),
        FakeHealth { healthy: true },
    );

    run_for(&store, &hosts, &proxy, &health, settings(), Duration::from_secs(6)).await;

    assert_eq!(proxy.activated(), 1);
    assert_eq!(proxy.validated(), 1);
    assert_eq!(store.acked(), 5);
    assert_eq!(store.processing_len(), 0);
    assert!(proxy.live().unwrap().contains("site-a.example.com"));
    for i in 0..5 {
        assert_eq!(store.reload_status(&format!("j-{i}")), Some(ReloadStatus::Success));
    }
    let report = store.last_report().unwrap();
    assert_eq!(report.state, CoordinatorState::Idle);
    assert_eq!(report.last_outcome, Some(CycleOutcome::Activated));
    assert!(report.last_reload_at.is_some());
    assert!(store.has_heartbeat("reload"));
}

#[tokio::test(start_paused = true)]
async fn test_ceiling_bounds_latency_under_continuous_requests() {
    let store = MemoryStore::new();
    let (hosts, proxy, health) = (FakeHosts::default(), FakeProxy::default(), FakeHealth { healthy: true });
    let token = CancellationToken::new();
    let coordinator = ReloadCoordinator::new(&store, &hosts, &proxy, &health, render_settings(), settings());

    let (result, activated_under_load) = tokio::join!(coordinator.run(&token, HEARTBEAT_TTL), async {
        for i in 0..12 {
            store
                .publish_reload(&reload_request(&format!("site-{i}"), None))
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        let activated = proxy.activated();
        tokio::time::sleep(Duration::from_secs(5)).await;
        token.cancel();
        activated
    });

    result.unwrap();
    assert!(activated_under_load >= 1, "requests every second must not starve the reload");
    assert_eq!(store.acked(), 12);
}

// ============================================================================
// Failure handling
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_validation_failure_keeps_live_config() {
    let store = MemoryStore::new();
    store
        .publish_reload(&reload_request("site-a", Some("j-bad")))
        .await
        .unwrap();
    let (hosts, proxy, health) = (
        FakeHosts::default(),
        FakeProxy::with_live("# last known good\n"),
        FakeHealth { healthy: true },
    );
    proxy.reject_next("nginx: [emerg] unknown directive \"proxy_passs\"");

    run_for(&store, &hosts, &proxy, &health, settings(), Duration::from_secs(5)).await;

    assert_eq!(store.states(), vec![
        CoordinatorState::Idle,
        CoordinatorState::Collecting,
        CoordinatorState::Rendering,
        CoordinatorState::Validating,
        CoordinatorState::FailedValidation,
        CoordinatorState::Idle,
    ]);
    assert_eq!(proxy.live().as_deref(), Some("# last known good\n"));
    assert_eq!(proxy.activated(), 0);
    assert_eq!(store.reload_status("j-bad"), Some(ReloadStatus::Failure));
    assert_eq!(store.acked(), 1);
    let report = store.last_report().unwrap();
    assert_eq!(report.last_outcome, Some(CycleOutcome::ValidationFailed));
    assert!(report.last_error.unwrap().contains("unknown directive"));
}

#[tokio::test(start_paused = true)]
async fn test_activation_failure_restores_last_known_good() {
    let store = MemoryStore::new();
    store
        .publish_reload(&reload_request("site-a", Some("j-1")))
        .await
        .unwrap();
    let (hosts, proxy, health) = (
        FakeHosts::default(),
        FakeProxy::with_live("# last known good\n"),
        FakeHealth { healthy: true },
    );
    proxy.fail_activation();

    run_for(&store, &hosts, &proxy, &health, settings(), Duration::from_secs(5)).await;

    assert_eq!(proxy.restored(), 1);
    assert_eq!(proxy.live().as_deref(), Some("# last known good\n"));
    assert_eq!(store.reload_status("j-1"), Some(ReloadStatus::Failure));
    assert_eq!(
        store.last_report().unwrap().last_outcome,
        Some(CycleOutcome::ActivationFailed)
    );
}

#[tokio::test(start_paused = true)]
async fn test_failed_health_probe_rolls_back() {
    let store = MemoryStore::new();
    let (hosts, proxy, health) = (
        FakeHosts::default(),
        FakeProxy::with_live("# last known good\n"),
        FakeHealth { healthy: false },
    );
    let mut coordinator =
        ReloadCoordinator::new(&store, &hosts, &proxy, &health, render_settings(), settings());
    let batch = Batch {
        requests: vec![reload_request("site-a", None)],
        resources: ["site-a".to_string()].into_iter().collect(),
    };

    let outcome = coordinator.run_cycle(&batch).await;

    assert_eq!(outcome, CycleOutcome::ActivationFailed);
    assert_eq!(proxy.restored(), 1);
    assert_eq!(proxy.live().as_deref(), Some("# last known good\n"));
    assert!(coordinator.report().last_error.as_deref().unwrap().contains("health"));
}

#[tokio::test(start_paused = true)]
async fn test_conflicting_domain_is_pruned_and_revalidated() {
    let store = MemoryStore::new();
    let (hosts, proxy, health) = (
        FakeHosts {
            prune_result: 1,
            ..FakeHosts::default()
        },
        FakeProxy::default(),
        FakeHealth { healthy: true },
    );
    proxy.reject_next(
        r#"nginx: [emerg] conflicting parameter "site-a.example.com" in /etc/nginx/proxy.conf:42"#,
    );
    let mut coordinator =
        ReloadCoordinator::new(&store, &hosts, &proxy, &health, render_settings(), settings());

    let outcome = coordinator.run_cycle(&Batch::default()).await;

    assert_eq!(outcome, CycleOutcome::Activated);
    assert_eq!(proxy.validated(), 2);
    assert_eq!(*hosts.pruned.lock().unwrap(), vec!["site-a.example.com".to_string()]);
}

// ============================================================================
// Scheduling
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_draining_workers_postpone_the_swap() {
    let store = MemoryStore::new();
    store
        .publish_reload(&reload_request("site-a", Some("j-1")))
        .await
        .unwrap();
    let (hosts, proxy, health) = (FakeHosts::default(), FakeProxy::default(), FakeHealth { healthy: true });
    proxy.drain_next(DrainStatus {
        active: 1,
        draining: 3,
    });

    run_for(&store, &hosts, &proxy, &health, settings(), Duration::from_secs(9)).await;

    assert_eq!(proxy.validated(), 1, "postponed attempt never renders");
    assert_eq!(proxy.activated(), 1);
    assert_eq!(store.reload_status("j-1"), Some(ReloadStatus::Success));
}

#[tokio::test(start_paused = true)]
async fn test_mandatory_reload_without_requests() {
    let store = MemoryStore::new();
    let (hosts, proxy, health) = (FakeHosts::default(), FakeProxy::default(), FakeHealth { healthy: true });
    let settings = CoordinatorSettings {
        max_interval_without_reload: Duration::from_secs(60),
        ..settings()
    };

    run_for(&store, &hosts, &proxy, &health, settings, Duration::from_secs(130)).await;

    assert_eq!(proxy.activated(), 2);
    assert_eq!(store.acked(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_no_requests_and_no_mandatory_interval_means_no_cycle() {
    let store = MemoryStore::new();
    let (hosts, proxy, health) = (FakeHosts::default(), FakeProxy::default(), FakeHealth { healthy: true });

    run_for(&store, &hosts, &proxy, &health, settings(), Duration::from_secs(30)).await;

    assert_eq!(proxy.validated(), 0);
    assert_eq!(store.states(), vec![CoordinatorState::Idle]);
}

#[tokio::test(start_paused = true)]
async fn test_failed_cycle_does_not_push_back_mandatory_reload() {
    let store = MemoryStore::new();
    let (hosts, proxy, health) = (FakeHosts::default(), FakeProxy::default(), FakeHealth { healthy: true });
    proxy.reject_next("nginx: [emerg] invalid number of arguments");
    let settings = CoordinatorSettings {
        max_interval_without_reload: Duration::from_secs(60),
        ..settings()
    };
    let token = CancellationToken::new();
    let coordinator = ReloadCoordinator::new(&store, &hosts, &proxy, &health, render_settings(), settings);

    let (result, ()) = tokio::join!(coordinator.run(&token, HEARTBEAT_TTL), async {
        tokio::time::sleep(Duration::from_secs(28)).await;
        store
            .publish_reload(&reload_request("site-a", Some("j-bad")))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(42)).await;
        token.cancel();
    });

    result.unwrap();
    assert_eq!(store.reload_status("j-bad"), Some(ReloadStatus::Failure));
    // Forced at 60s from start, not 60s after the failed cycle at 30s.
    assert_eq!(proxy.validated(), 2);
    assert_eq!(proxy.activated(), 1);
}

// ============================================================================
// Redelivery
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_unacknowledged_requests_are_redelivered_after_restart() {
    let store = MemoryStore::new();
    store.leave_in_processing(reload_request("site-a", Some("j-old")));
    let (hosts, proxy, health) = (FakeHosts::default(), FakeProxy::default(), FakeHealth { healthy: true });

    run_for(&store, &hosts, &proxy, &health, settings(), Duration::from_secs(5)).await;

    assert_eq!(proxy.activated(), 1);
    assert_eq!(store.acked(), 1);
    assert_eq!(store.processing_len(), 0);
    assert_eq!(store.reload_status("j-old"), Some(ReloadStatus::Success));
}

// ============================================================================
// Store outage
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_request_after_store_recovers_gets_one_cycle() {
    let store = MemoryStore::new();
    let (hosts, proxy, health) = (FakeHosts::default(), FakeProxy::default(), FakeHealth { healthy: true });
    store.set_failing(true);
    let token = CancellationToken::new();
    let coordinator = ReloadCoordinator::new(&store, &hosts, &proxy, &health, render_settings(), settings());

    let (result, ()) = tokio::join!(coordinator.run(&token, HEARTBEAT_TTL), async {
        tokio::time::sleep(Duration::from_secs(1)).await;
        store.set_failing(false);
        store
            .publish_reload(&reload_request("site-a", Some("j-1")))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(6)).await;
        token.cancel();
    });

    result.unwrap();
    assert_eq!(proxy.activated(), 1);
    assert_eq!(store.acked(), 1);
    assert_eq!(store.reload_status("j-1"), Some(ReloadStatus::Success));
}

#[tokio::test(start_paused = true)]
async fn test_separate_short_outages_do_not_add_up() {
    let store = MemoryStore::new();
    let (hosts, proxy, health) = (FakeHosts::default(), FakeProxy::default(), FakeHealth { healthy: true });
    let token = CancellationToken::new();
    let coordinator = ReloadCoordinator::new(&store, &hosts, &proxy, &health, render_settings(), settings());

    let (result, ()) = tokio::join!(coordinator.run(&token, HEARTBEAT_TTL), async {
        for _ in 0..2 {
            store.set_failing(true);
            tokio::time::sleep(Duration::from_millis(1500)).await;
            store.set_failing(false);
            tokio::time::sleep(Duration::from_secs(3)).await;
        }
        store
            .publish_reload(&reload_request("site-a", Some("j-2")))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        token.cancel();
    });

    result.unwrap();
    assert_eq!(proxy.activated(), 1);
    assert_eq!(store.reload_status("j-2"), Some(ReloadStatus::Success));
}

#[tokio::test(start_paused = true)]
async fn test_coordinator_gives_up_once_store_stays_down() {
    let store = MemoryStore::new();
    let (hosts, proxy, health) = (FakeHosts::default(), FakeProxy::default(), FakeHealth { healthy: true });
    store.set_failing(true);
    let token = CancellationToken::new();
    let coordinator = ReloadCoordinator::new(&store, &hosts, &proxy, &health, render_settings(), settings());
    let started = tokio::time::Instant::now();

    let result = tokio::time::timeout(Duration::from_secs(10), coordinator.run(&token, HEARTBEAT_TTL))
        .await
        .expect("coordinator should give up before the timeout");

    let err = result.unwrap_err();
    let elapsed = started.elapsed();
    assert!(elapsed >= retry_policy().give_up_after, "gave up after {elapsed:?}");
    assert!(elapsed < retry_policy().give_up_after + Duration::from_secs(1), "gave up after {elapsed:?}");
    let message = format!("{err:#}");
    assert!(message.contains("reload channel unavailable"), "{message}");
    assert!(message.contains("connection refused"), "{message}");
    assert_eq!(proxy.validated(), 0);
}
