//! `press-agent status <job-id>` — print a job's status record.

use anyhow::Result;
use clap::Args;

use crate::app::AppContext;
use crate::application::ports::{ReloadChannel, StatusStore};
use crate::commands::print_json;

#[derive(Args, Debug)]
pub struct StatusArgs {
    pub job_id: String,
}

/// # Errors
///
/// Returns an error if no record exists or the store is unreachable.
pub async fn run(app: &AppContext, args: &StatusArgs) -> Result<()> {
    let store = app.connect_store().await?;
    let Some(record) = store.get_status(&args.job_id).await? else {
        anyhow::bail!("no status recorded for job {}", args.job_id);
    };
    let reload = store.get_reload_status(&args.job_id).await?;
    print_json(&serde_json::json!({ "job": record, "reload": reload }))
}
