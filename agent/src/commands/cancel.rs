//! `press-agent cancel <job-id>` — cancel a job that has not started.

use anyhow::Result;
use clap::Args;

use crate::app::AppContext;
use crate::application::services::jobs::{CancelOutcome, cancel_job};
use crate::commands::print_json;

#[derive(Args, Debug)]
pub struct CancelArgs {
    pub job_id: String,
}

/// # Errors
///
/// Returns an error if the job is already running or finished.
pub async fn run(app: &AppContext, args: &CancelArgs) -> Result<()> {
    let store = app.connect_store().await?;
    match cancel_job(&store, &args.job_id).await? {
        CancelOutcome::Cancelled(record) => print_json(&record),
        CancelOutcome::NotCancellable(Some(status)) => {
            anyhow::bail!("job {} is {status} and can no longer be cancelled", args.job_id)
        }
        CancelOutcome::NotCancellable(None) => anyhow::bail!("unknown job {}", args.job_id),
    }
}
