//! `press-agent enqueue` — submit a job (operations and testing).

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Args;
use press_common::{JobPayload, Priority, StepSpec};

use crate::app::AppContext;
use crate::application::services::jobs::submit_job;
use crate::commands::print_json;

#[derive(Args, Debug)]
pub struct EnqueueArgs {
    /// Resource id the job mutates (bench or site)
    #[arg(long)]
    pub resource: String,

    /// Queue priority: high, default or low
    #[arg(long, default_value = "default")]
    pub priority: Priority,

    /// Steps as a JSON array of {"name", "method", "args"}
    #[arg(long)]
    pub steps: String,

    /// Job id (a random UUID when omitted)
    #[arg(long)]
    pub id: Option<String>,
}

/// Build the payload described by `args`.
///
/// # Errors
///
/// Returns an error if `--steps` is not a JSON step list.
pub fn build_job(args: &EnqueueArgs) -> Result<JobPayload> {
    let steps: Vec<StepSpec> =
        serde_json::from_str(&args.steps).context("--steps must be a JSON array of steps")?;
    Ok(JobPayload {
        id: args
            .id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        priority: args.priority,
        resource_id: args.resource.clone(),
        steps,
        created_at: Utc::now(),
        attempts: 0,
    })
}

/// # Errors
///
/// Returns an error if the job is invalid or the store is unreachable.
pub async fn run(app: &AppContext, args: &EnqueueArgs) -> Result<()> {
    let job = build_job(args)?;
    let store = app.connect_store().await?;
    submit_job(&store, &job).await?;
    print_json(&serde_json::json!({ "id": job.id, "priority": job.priority }))
}
