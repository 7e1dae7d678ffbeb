//! Loads routing state from `nginx/hosts` and `nginx/upstreams`.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::SystemTime;

use anyhow::{Context, Result};

use crate::application::ports::HostStateSource;
use crate::domain::proxy_config::{HostEntry, HostState, SiteRoute, SiteStatus, Upstream};
use crate::domain::{HostLayout, StepError};
use crate::infra::fs::{list_entries, read_string_map, remove_file_if_exists};

/// Production `HostStateSource` over the agent's nginx directory.
pub struct FsHostState {
    layout: HostLayout,
}

impl FsHostState {
    #[must_use]
    pub fn new(layout: HostLayout) -> Self {
        Self { layout }
    }
}

/// Synchronous load, also used by the offline `render` command.
///
/// # Errors
///
/// Returns an error if a directory cannot be listed or a JSON file is malformed.
pub fn load_host_state(layout: &HostLayout) -> Result<HostState, StepError> {
    let mut state = HostState::default();

    let hosts_dir = layout.hosts_directory();
    for host in list_entries(&hosts_dir, true)? {
        let dir = hosts_dir.join(&host);
        let entry = HostEntry {
            map: read_string_map(&dir.join("map.json"))?,
            redirects: read_string_map(&dir.join("redirect.json"))?,
            codeserver: dir.join("codeserver").exists(),
        };
        state.hosts.insert(host, entry);
    }

    let secondaries = read_secondaries(&layout.secondaries_file())?;

    let upstreams_dir = layout.upstreams_directory();
    for name in list_entries(&upstreams_dir, true)? {
        let dir = upstreams_dir.join(&name);
        let mut sites = Vec::new();
        for site in list_entries(&dir, false)? {
            let path = dir.join(&site);
            let contents = std::fs::read_to_string(&path)
                .map_err(|e| StepError::io(format!("reading {}", path.display()), e))?;
            sites.push(SiteRoute {
                name: site,
                status: SiteStatus::parse(&contents),
            });
        }
        let upstream = Upstream {
            sites,
            secondaries: secondaries.get(&name).cloned().unwrap_or_default(),
        };
        state.upstreams.insert(name, upstream);
    }
    Ok(state)
}

/// Primary upstream → secondary servers. A missing file reads as empty; an
/// unreadable one is an error, so a render never silently drops secondaries.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read or parsed.
pub fn read_secondaries(path: &Path) -> Result<BTreeMap<String, Vec<String>>, StepError> {
    match std::fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map_err(|e| StepError::Command(format!("parsing {}: {e}", path.display()))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
        Err(e) => Err(StepError::io(format!("reading {}", path.display()), e)),
    }
}

/// Remove duplicate site files for `domain`, keeping the newest.
///
/// # Errors
///
/// Returns an error if an upstream directory cannot be listed or a file removed.
pub fn prune_conflicting(layout: &HostLayout, domain: &str) -> Result<usize, StepError> {
    let mut copies: Vec<(SystemTime, std::path::PathBuf)> = Vec::new();
    for upstream in list_entries(&layout.upstreams_directory(), true)? {
        let Ok(file) = layout.site_file(&upstream, domain) else {
            continue;
        };
        if let Ok(meta) = std::fs::metadata(&file) {
            let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            copies.push((modified, file));
        }
    }
    if copies.len() < 2 {
        return Ok(0);
    }
    copies.sort();
    copies.pop();
    let mut removed = 0;
    for (_, file) in copies {
        if remove_file_if_exists(&file)? {
            tracing::warn!(file = %file.display(), %domain, "removed conflicting site file");
            removed += 1;
        }
    }
    Ok(removed)
}

impl HostStateSource for FsHostState {
    async fn load_host_state(&self) -> Result<HostState> {
        let layout = self.layout.clone();
        tokio::task::spawn_blocking(move || load_host_state(&layout))
            .await
            .context("host state load task panicked")?
            .context("loading host state")
    }

    async fn prune_conflicting(&self, domain: &str) -> Result<usize> {
        let layout = self.layout.clone();
        let domain = domain.to_string();
        tokio::task::spawn_blocking(move || prune_conflicting(&layout, &domain))
            .await
            .context("prune task panicked")?
            .context("pruning conflicting site files")
    }
}
