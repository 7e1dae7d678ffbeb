//! Application context — configuration and wiring shared by every command.
//!
//! `AppContext` is built once in `Cli::run()` from the environment plus CLI
//! overrides, and constructs the concrete adapters each command needs.

use std::time::Duration;

use anyhow::Result;

use crate::application::StepRegistry;
use crate::domain::{AgentConfig, HostLayout, RenderSettings};
use crate::infra::command_runner::TokioCommandRunner;
use crate::infra::config::{instance_id, load_config};
use crate::infra::health::HttpHealthProbe;
use crate::infra::host_fs::FsHostState;
use crate::infra::nginx::{NginxCommands, NginxDriver};
use crate::infra::steps::default_registry;
use crate::infra::valkey::ValkeyStore;

/// Settings given on the command line; each replaces its environment value.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub valkey_url: Option<String>,
    pub bench_directory: Option<String>,
    pub nginx_directory: Option<String>,
}

pub struct AppContext {
    pub config: AgentConfig,
    /// `hostname-pid` of this process.
    pub instance: String,
}

impl AppContext {
    /// Load configuration and apply CLI overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the environment holds an invalid configuration.
    pub fn new(overrides: Overrides) -> Result<Self> {
        let mut config = load_config()?;
        if let Some(url) = overrides.valkey_url {
            config.valkey_url = url;
        }
        if let Some(dir) = overrides.bench_directory {
            config.bench_directory = dir;
        }
        if let Some(dir) = overrides.nginx_directory {
            config.nginx_directory = dir;
        }
        Ok(Self {
            config,
            instance: instance_id(),
        })
    }

    pub fn layout(&self) -> HostLayout {
        HostLayout::new(&self.config.bench_directory, &self.config.nginx_directory)
    }

    pub fn render_settings(&self) -> RenderSettings {
        RenderSettings {
            nginx_directory: self.config.nginx_directory.clone(),
            tls_protocols: self.config.tls_protocols.clone(),
        }
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.config.command_timeout_secs.max(1))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.config.shutdown_grace_secs)
    }

    /// # Errors
    ///
    /// Returns an error if Valkey cannot be reached.
    pub async fn connect_store(&self) -> Result<ValkeyStore> {
        ValkeyStore::connect(&self.config).await
    }

    pub fn registry(&self) -> StepRegistry {
        default_registry(
            TokioCommandRunner::new(self.command_timeout()),
            self.command_timeout(),
            self.config.domain.clone(),
        )
    }

    pub fn host_state(&self) -> FsHostState {
        FsHostState::new(self.layout())
    }

    pub fn nginx_driver(&self) -> NginxDriver<TokioCommandRunner> {
        NginxDriver::new(
            &self.config.nginx_directory,
            NginxCommands {
                validate: self.config.validate_command.clone(),
                reload: self.config.reload_command.clone(),
                status: self.config.status_command.clone(),
                timeout: self.command_timeout(),
            },
            TokioCommandRunner::new(self.command_timeout()),
        )
    }

    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn health_probe(&self) -> Result<HttpHealthProbe> {
        HttpHealthProbe::new(self.config.health_url.clone())
    }
}
