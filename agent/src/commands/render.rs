//! `press-agent render` — print the proxy configuration the coordinator
//! would build from the host directories. Needs no store connection.

use anyhow::{Context, Result};

use crate::app::AppContext;
use crate::domain::proxy_config::render;
use crate::infra::host_fs::load_host_state;

/// # Errors
///
/// Returns an error if the host directories cannot be read.
pub fn run(app: &AppContext) -> Result<()> {
    let state = load_host_state(&app.layout()).context("loading host state")?;
    print!("{}", render(&state, &app.render_settings()));
    Ok(())
}
