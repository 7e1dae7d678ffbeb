//! Loads `AgentConfig` from `PRESS_AGENT_*` environment variables.

use anyhow::{Context, Result};

use crate::domain::AgentConfig;

pub const ENV_PREFIX: &str = "PRESS_AGENT_";

/// Read and validate the configuration from the process environment.
///
/// # Errors
///
/// Returns an error if a variable cannot be parsed or the result is invalid.
pub fn load_config() -> Result<AgentConfig> {
    config_from_vars(std::env::vars())
}

/// Same as [`load_config`] over an explicit variable list.
///
/// # Errors
///
/// Returns an error if a variable cannot be parsed or the result is invalid.
pub fn config_from_vars<I>(vars: I) -> Result<AgentConfig>
where
    I: IntoIterator<Item = (String, String)>,
{
    let config: AgentConfig = envy::prefixed(ENV_PREFIX)
        .from_iter(vars)
        .context("cannot parse PRESS_AGENT_* environment")?;
    config.validate().context("invalid agent configuration")?;
    Ok(config)
}

/// `hostname-pid`, identifying this process in heartbeats and status records.
pub fn instance_id() -> String {
    let host = std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string());
    format!("{host}-{}", std::process::id())
}
