//! `press-agent reload` — the long-running reload coordinator.

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use crate::app::AppContext;
use crate::application::services::reload_coordinator::ReloadCoordinator;
use crate::shutdown::run_with_grace;

/// Coordinate proxy reloads until shutdown.
///
/// # Errors
///
/// Returns an error if the store is unreachable at startup or becomes
/// unhealthy while running.
pub async fn run(app: &AppContext, shutdown: &CancellationToken) -> Result<()> {
    let store = app.connect_store().await?;
    let hosts = app.host_state();
    let proxy = app.nginx_driver();
    let health = app.health_probe()?;

    let coordinator = ReloadCoordinator::new(
        &store,
        &hosts,
        &proxy,
        &health,
        app.render_settings(),
        app.config.coordinator_settings(&app.instance),
    );
    run_with_grace(
        coordinator.run(shutdown, app.config.heartbeat_ttl()),
        shutdown,
        app.shutdown_grace(),
    )
    .await
}
