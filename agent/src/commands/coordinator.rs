//! `press-agent coordinator` — print the reload coordinator's last report.

use anyhow::Result;

use crate::app::AppContext;
use crate::application::ports::ReloadChannel;
use crate::commands::print_json;

/// # Errors
///
/// Returns an error if the store is unreachable or no coordinator has run.
pub async fn run(app: &AppContext) -> Result<()> {
    let store = app.connect_store().await?;
    match store.get_coordinator_report().await? {
        Some(report) => print_json(&report),
        None => anyhow::bail!("no reload coordinator report published yet"),
    }
}
