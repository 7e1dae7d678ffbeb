//! `execute`: run a command for a bench or site with a timeout.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use super::parse_args;
use crate::application::ports::CommandRunner;
use crate::application::steps::{EffectClass, StepContext, StepMethod};
use crate::domain::StepError;
use crate::infra::command_runner::combined_output;

#[derive(Deserialize)]
struct ExecuteArgs {
    /// argv; never passed through a shell.
    command: Vec<String>,
    /// Working directory relative to the bench directory.
    #[serde(default)]
    directory: Option<String>,
    #[serde(default)]
    timeout_secs: Option<u64>,
}

pub struct Execute<R> {
    runner: R,
    default_timeout: Duration,
}

impl<R: CommandRunner> Execute<R> {
    pub fn new(runner: R, default_timeout: Duration) -> Self {
        Self {
            runner,
            default_timeout,
        }
    }
}

#[async_trait(?Send)]
impl<R: CommandRunner> StepMethod for Execute<R> {
    fn name(&self) -> &'static str {
        "execute"
    }

    fn effect(&self) -> EffectClass {
        EffectClass::Host
    }

    async fn execute(&self, ctx: &StepContext<'_>, args: &Value) -> Result<Option<String>, StepError> {
        let args: ExecuteArgs = parse_args(self.name(), args)?;
        let Some((program, rest)) = args.command.split_first() else {
            return Err(StepError::invalid("execute: command must not be empty"));
        };
        let dir = args
            .directory
            .as_deref()
            .map(|d| ctx.layout.bench_path(d))
            .transpose()?;
        let timeout = args
            .timeout_secs
            .map_or(self.default_timeout, Duration::from_secs);
        let argv: Vec<&str> = rest.iter().map(String::as_str).collect();

        tracing::debug!(job_id = %ctx.job_id, %program, "executing command");
        let output = self
            .runner
            .run_in_dir(program, &argv, dir.as_deref(), timeout)
            .await
            .map_err(|e| StepError::Command(format!("{e:#}")))?;

        let text = combined_output(&output);
        if output.status.success() {
            Ok(Some(text))
        } else {
            let code = output
                .status
                .code()
                .map_or_else(|| "signal".to_string(), |c| c.to_string());
            Err(StepError::Command(format!(
                "{program} exited with {code}: {text}"
            )))
        }
    }
}
