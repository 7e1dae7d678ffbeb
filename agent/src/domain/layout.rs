//! Host directory layout and path confinement for step arguments.

use std::path::{Component, Path, PathBuf};

use crate::domain::error::StepError;

/// Where host state lives on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostLayout {
    pub bench_directory: PathBuf,
    pub nginx_directory: PathBuf,
}

impl HostLayout {
    pub fn new(bench_directory: impl Into<PathBuf>, nginx_directory: impl Into<PathBuf>) -> Self {
        Self {
            bench_directory: bench_directory.into(),
            nginx_directory: nginx_directory.into(),
        }
    }

    pub fn hosts_directory(&self) -> PathBuf {
        self.nginx_directory.join("hosts")
    }

    pub fn upstreams_directory(&self) -> PathBuf {
        self.nginx_directory.join("upstreams")
    }

    pub fn secondaries_file(&self) -> PathBuf {
        self.nginx_directory.join("secondaries.json")
    }

    /// Resolve a relative path under the bench directory.
    ///
    /// # Errors
    ///
    /// Rejects absolute paths and any `..` component.
    pub fn bench_path(&self, relative: &str) -> Result<PathBuf, StepError> {
        confine(&self.bench_directory, relative)
    }

    /// `hosts/<host>`; the host name must be a single path segment.
    ///
    /// # Errors
    ///
    /// Rejects names that are not a single normal segment.
    pub fn host_path(&self, host: &str) -> Result<PathBuf, StepError> {
        Ok(self.hosts_directory().join(segment(host, "host")?))
    }

    /// `upstreams/<upstream>`.
    ///
    /// # Errors
    ///
    /// Rejects names that are not a single normal segment.
    pub fn upstream_path(&self, upstream: &str) -> Result<PathBuf, StepError> {
        Ok(self.upstreams_directory().join(segment(upstream, "upstream")?))
    }

    /// `upstreams/<upstream>/<site>`.
    ///
    /// # Errors
    ///
    /// Rejects names that are not a single normal segment.
    pub fn site_file(&self, upstream: &str, site: &str) -> Result<PathBuf, StepError> {
        Ok(self.upstream_path(upstream)?.join(segment(site, "site")?))
    }
}

/// Join `relative` onto `root`, refusing anything that could escape it.
///
/// # Errors
///
/// Returns `InvalidArgs` for empty, absolute, or parent-relative paths.
pub fn confine(root: &Path, relative: &str) -> Result<PathBuf, StepError> {
    if relative.trim().is_empty() {
        return Err(StepError::invalid("path must not be empty"));
    }
    let candidate = Path::new(relative);
    let mut resolved = root.to_path_buf();
    for component in candidate.components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(StepError::invalid(format!(
                    "path '{relative}' must stay inside {}",
                    root.display()
                )));
            }
        }
    }
    Ok(resolved)
}

fn segment<'a>(name: &'a str, what: &str) -> Result<&'a str, StepError> {
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) if !name.contains('/') => Ok(name),
        _ => Err(StepError::invalid(format!("invalid {what} name '{name}'"))),
    }
}
