//! Built-in step methods and the default registry.

mod execute;
mod files;
mod proxy;

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::application::ports::CommandRunner;
use crate::application::steps::StepRegistry;
use crate::domain::StepError;

pub use execute::Execute;
pub use files::{CreateDirectory, WriteConfig, WriteFile};
pub use proxy::{
    AddHost, AddSiteToUpstream, AddUpstream, ReloadProxy, RemoveHost, RemoveRedirects,
    RemoveSiteFromUpstream, RenameUpstream, SetUpstreamSecondaries, SetupRedirects,
    UpdateSiteStatus,
};

/// Registry with every built-in method.
pub fn default_registry<R>(runner: R, command_timeout: Duration, domain: Option<String>) -> StepRegistry
where
    R: CommandRunner + 'static,
{
    StepRegistry::new()
        .with(CreateDirectory)
        .with(WriteFile)
        .with(WriteConfig)
        .with(Execute::new(runner, command_timeout))
        .with(AddHost)
        .with(RemoveHost)
        .with(AddUpstream)
        .with(RenameUpstream)
        .with(AddSiteToUpstream)
        .with(RemoveSiteFromUpstream)
        .with(UpdateSiteStatus)
        .with(SetUpstreamSecondaries)
        .with(SetupRedirects)
        .with(RemoveRedirects::new(domain))
        .with(ReloadProxy)
}

/// Decode step arguments into the method's argument struct.
fn parse_args<T: DeserializeOwned>(method: &str, args: &Value) -> Result<T, StepError> {
    let value = if args.is_null() {
        Value::Object(serde_json::Map::new())
    } else {
        args.clone()
    };
    serde_json::from_value(value).map_err(|e| StepError::invalid(format!("{method}: {e}")))
}
