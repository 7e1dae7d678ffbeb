//! nginx implementation of the `ProxyDriver` port.
//!
//! Files under the nginx directory:
//! - `proxy.conf` — live configuration, included by the main nginx config
//! - `proxy.conf.candidate` — rendered, not yet validated
//! - `proxy.conf.last-good` — copy of the live file taken before each swap
//! - `proxy.conf.harness` — minimal main config that includes only the candidate

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};

use crate::application::ports::{CommandRunner, ProxyDriver, Validation};
use crate::domain::DrainStatus;
use crate::domain::config::expand_command;
use crate::infra::command_runner::combined_output;
use crate::infra::fs::write_atomic;

const LIVE_FILE: &str = "proxy.conf";

/// Configured proxy control commands.
#[derive(Debug, Clone)]
pub struct NginxCommands {
    /// May use `{harness}` and `{candidate}` placeholders.
    pub validate: String,
    pub reload: String,
    pub status: String,
    pub timeout: Duration,
}

pub struct NginxDriver<R> {
    directory: PathBuf,
    commands: NginxCommands,
    runner: R,
}

impl<R: CommandRunner> NginxDriver<R> {
    pub fn new(directory: impl Into<PathBuf>, commands: NginxCommands, runner: R) -> Self {
        Self {
            directory: directory.into(),
            commands,
            runner,
        }
    }

    pub fn live_path(&self) -> PathBuf {
        self.directory.join(LIVE_FILE)
    }

    pub fn candidate_path(&self) -> PathBuf {
        self.directory.join(format!("{LIVE_FILE}.candidate"))
    }

    pub fn backup_path(&self) -> PathBuf {
        self.directory.join(format!("{LIVE_FILE}.last-good"))
    }

    fn harness_path(&self) -> PathBuf {
        self.directory.join(format!("{LIVE_FILE}.harness"))
    }

    async fn run_configured(&self, command: &str, vars: &[(&str, &str)]) -> Result<(bool, String)> {
        let argv = expand_command(command, vars);
        let Some((program, rest)) = argv.split_first() else {
            anyhow::bail!("empty proxy command");
        };
        let args: Vec<&str> = rest.iter().map(String::as_str).collect();
        let output = self
            .runner
            .run_in_dir(program, &args, None, self.commands.timeout)
            .await?;
        Ok((output.status.success(), combined_output(&output)))
    }

    async fn signal_reload(&self) -> Result<()> {
        let (ok, output) = self
            .run_configured(&self.commands.reload, &[])
            .await
            .context("running reload command")?;
        if !ok {
            anyhow::bail!("proxy reload failed: {output}");
        }
        Ok(())
    }
}

async fn blocking_io<T, F>(label: &'static str, f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .with_context(|| format!("{label} task panicked"))?
}

fn copy_atomic(from: &Path, to: &Path) -> Result<()> {
    let bytes = std::fs::read(from).with_context(|| format!("reading {}", from.display()))?;
    write_atomic(to, &bytes)?;
    Ok(())
}

impl<R: CommandRunner> ProxyDriver for NginxDriver<R> {
    async fn write_candidate(&self, text: &str) -> Result<()> {
        let path = self.candidate_path();
        let body = text.as_bytes().to_vec();
        blocking_io("write candidate", move || {
            write_atomic(&path, &body)?;
            Ok(())
        })
        .await
    }

    async fn validate_candidate(&self) -> Result<Validation> {
        let candidate = self.candidate_path();
        let harness = self.harness_path();
        let body = format!(
            "events {{}}\n\nhttp {{\n    include {};\n}}\n",
            candidate.display()
        );
        let harness_file = harness.clone();
        blocking_io("write harness", move || {
            write_atomic(&harness_file, body.as_bytes())?;
            Ok(())
        })
        .await?;

        let harness_str = harness.display().to_string();
        let candidate_str = candidate.display().to_string();
        let (ok, output) = self
            .run_configured(
                &self.commands.validate,
                &[("harness", &harness_str), ("candidate", &candidate_str)],
            )
            .await
            .context("running validation command")?;
        Ok(Validation { ok, output })
    }

    async fn activate_candidate(&self) -> Result<()> {
        let live = self.live_path();
        let candidate = self.candidate_path();
        let backup = self.backup_path();
        blocking_io("swap", move || {
            if live.exists() {
                copy_atomic(&live, &backup)?;
            } else if backup.exists() {
                std::fs::remove_file(&backup)
                    .with_context(|| format!("removing stale {}", backup.display()))?;
            }
            std::fs::rename(&candidate, &live)
                .with_context(|| format!("moving candidate into {}", live.display()))
        })
        .await?;
        self.signal_reload().await
    }

    async fn restore_last_good(&self) -> Result<()> {
        let live = self.live_path();
        let backup = self.backup_path();
        blocking_io("restore", move || {
            if backup.exists() {
                copy_atomic(&backup, &live)
            } else {
                // Nothing was live before the failed swap.
                match std::fs::remove_file(&live) {
                    Ok(()) => Ok(()),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                    Err(e) => Err(e).with_context(|| format!("removing {}", live.display())),
                }
            }
        })
        .await?;
        self.signal_reload().await
    }

    async fn live_config(&self) -> Result<Option<String>> {
        let live = self.live_path();
        match tokio::fs::read_to_string(&live).await {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("reading {}", live.display())),
        }
    }

    async fn drain_status(&self) -> Result<DrainStatus> {
        // `systemctl status` exits non-zero for inactive units; parse anyway.
        let (_, output) = self
            .run_configured(&self.commands.status, &[])
            .await
            .context("running proxy status command")?;
        Ok(DrainStatus::parse(&output))
    }
}
