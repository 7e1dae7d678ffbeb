//! HTTP health probe run after a proxy reload.

use std::time::Duration;

use anyhow::{Context, Result};

use crate::application::ports::HealthProbe;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Probes `url` with a GET; no URL configured means the probe always passes.
pub struct HttpHealthProbe {
    client: reqwest::Client,
    url: Option<String>,
}

impl HttpHealthProbe {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(url: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(PROBE_TIMEOUT)
            .build()
            .context("building health probe client")?;
        Ok(Self { client, url })
    }
}

impl HealthProbe for HttpHealthProbe {
    async fn probe(&self) -> Result<()> {
        let Some(url) = self.url.as_deref() else {
            return Ok(());
        };
        let response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("health probe {url} failed"))?;
        let status = response.status();
        if status.is_server_error() {
            anyhow::bail!("health probe {url} returned {status}");
        }
        tracing::debug!(%url, %status, "health probe passed");
        Ok(())
    }
}
