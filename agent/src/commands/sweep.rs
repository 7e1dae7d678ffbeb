//! `press-agent sweep` — one stale-job reconciliation pass.

use anyhow::Result;
use chrono::Utc;

use crate::app::AppContext;
use crate::application::services::sweep::sweep_stale;
use crate::commands::print_json;

/// # Errors
///
/// Returns an error if the store is unreachable.
pub async fn run(app: &AppContext) -> Result<()> {
    let store = app.connect_store().await?;
    let report = sweep_stale(&store, app.config.stale_after(), Utc::now()).await?;
    tracing::info!(
        requeued = report.requeued.len(),
        healthy = report.healthy,
        orphaned = report.orphaned.len(),
        "sweep finished"
    );
    print_json(&report)
}
