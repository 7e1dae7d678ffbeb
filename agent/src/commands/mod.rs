//! Command implementations — one module per subcommand.

pub mod cancel;
pub mod coordinator;
pub mod enqueue;
pub mod reload;
pub mod render;
pub mod status;
pub mod sweep;
pub mod worker;

use anyhow::{Context, Result};
use serde::Serialize;

/// Print `value` as pretty JSON on stdout.
pub(crate) fn print_json(value: &impl Serialize) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("serializing output")?;
    println!("{json}");
    Ok(())
}
