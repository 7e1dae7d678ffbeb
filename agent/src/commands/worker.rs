//! `press-agent worker` — the long-running job worker.

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use crate::app::AppContext;
use crate::application::services::worker::run_worker;
use crate::shutdown::run_with_grace;

/// Serve the configured queues until shutdown.
///
/// # Errors
///
/// Returns an error if the store is unreachable at startup or becomes
/// unhealthy while running.
pub async fn run(app: &AppContext, shutdown: &CancellationToken) -> Result<()> {
    let settings = app.config.worker_settings(&app.instance)?;
    let store = app.connect_store().await?;
    let registry = app.registry();
    let layout = app.layout();
    tracing::debug!(methods = ?registry, "step registry loaded");

    let work = async {
        run_worker(
            &store,
            &registry,
            &layout,
            &settings,
            app.config.heartbeat_ttl(),
            shutdown,
        )
        .await
        .map(|_| ())
    };
    run_with_grace(work, shutdown, app.shutdown_grace()).await
}
