//! Bench filesystem steps.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};

use super::parse_args;
use crate::application::steps::{EffectClass, StepContext, StepMethod};
use crate::domain::StepError;
use crate::infra::fs::{blocking, write_atomic};

// ── create_directory ──────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct PathArgs {
    path: String,
}

/// `mkdir -p` below the bench directory.
pub struct CreateDirectory;

#[async_trait(?Send)]
impl StepMethod for CreateDirectory {
    fn name(&self) -> &'static str {
        "create_directory"
    }

    fn effect(&self) -> EffectClass {
        EffectClass::Host
    }

    async fn execute(&self, ctx: &StepContext<'_>, args: &Value) -> Result<Option<String>, StepError> {
        let args: PathArgs = parse_args(self.name(), args)?;
        let path = ctx.layout.bench_path(&args.path)?;
        blocking(move || {
            std::fs::create_dir_all(&path)
                .map_err(|e| StepError::io(format!("creating {}", path.display()), e))?;
            Ok(Some(format!("created {}", path.display())))
        })
        .await
    }
}

// ── write_file ────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct WriteFileArgs {
    path: String,
    content: String,
    #[serde(default)]
    mode: Option<u32>,
}

/// Atomically write a file below the bench directory.
pub struct WriteFile;

#[async_trait(?Send)]
impl StepMethod for WriteFile {
    fn name(&self) -> &'static str {
        "write_file"
    }

    fn effect(&self) -> EffectClass {
        EffectClass::Host
    }

    async fn execute(&self, ctx: &StepContext<'_>, args: &Value) -> Result<Option<String>, StepError> {
        let args: WriteFileArgs = parse_args(self.name(), args)?;
        let path = ctx.layout.bench_path(&args.path)?;
        blocking(move || {
            write_atomic(&path, args.content.as_bytes())?;
            #[cfg(unix)]
            if let Some(mode) = args.mode {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode))
                    .map_err(|e| StepError::io(format!("setting mode on {}", path.display()), e))?;
            }
            Ok(Some(format!(
                "wrote {} bytes to {}",
                args.content.len(),
                path.display()
            )))
        })
        .await
    }
}

// ── write_config ──────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct WriteConfigArgs {
    bench: String,
    #[serde(default)]
    site: Option<String>,
    #[serde(default)]
    config: Map<String, Value>,
    #[serde(default)]
    remove: Vec<String>,
}

/// Merge keys into `<bench>/sites/<site>/site_config.json`.
///
/// Site config carries routing-relevant values (host name, domains), so this
/// step requests a proxy reload.
pub struct WriteConfig;

#[async_trait(?Send)]
impl StepMethod for WriteConfig {
    fn name(&self) -> &'static str {
        "write_config"
    }

    fn effect(&self) -> EffectClass {
        EffectClass::Routing
    }

    async fn execute(&self, ctx: &StepContext<'_>, args: &Value) -> Result<Option<String>, StepError> {
        let args: WriteConfigArgs = parse_args(self.name(), args)?;
        let site = args.site.as_deref().unwrap_or(ctx.resource_id);
        let relative = format!("{}/sites/{site}/site_config.json", args.bench);
        let path = ctx.layout.bench_path(&relative)?;
        blocking(move || {
            let mut current = match std::fs::read(&path) {
                Ok(bytes) => serde_json::from_slice::<Map<String, Value>>(&bytes).map_err(|e| {
                    StepError::Command(format!("parsing {}: {e}", path.display()))
                })?,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Map::new(),
                Err(e) => return Err(StepError::io(format!("reading {}", path.display()), e)),
            };
            let changed = args.config.len() + args.remove.len();
            for key in &args.remove {
                current.remove(key);
            }
            current.extend(args.config);
            let body = serde_json::to_vec_pretty(&current)
                .map_err(|e| StepError::Command(format!("serializing site config: {e}")))?;
            write_atomic(&path, &body)?;
            Ok(Some(format!("updated {changed} keys in {}", path.display())))
        })
        .await
    }
}
