//! Routing steps: they edit `nginx/hosts` and `nginx/upstreams` and never
//! touch the rendered proxy configuration, which only the reload coordinator
//! writes.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use super::parse_args;
use crate::application::steps::{EffectClass, StepContext, StepMethod};
use crate::domain::layout::HostLayout;
use crate::domain::StepError;
use crate::infra::fs::{
    blocking, list_entries, read_string_map, remove_dir_if_exists, remove_file_if_exists,
    write_atomic, write_string_map,
};
use crate::infra::host_fs::read_secondaries;

/// Lock key shared by every writer of `upstreams/secondaries.json`. The `:`
/// keeps it apart from any valid resource id.
pub const SECONDARIES_LOCK: &str = "host:secondaries";

/// Declares a routing step: name, argument struct, body. The three-binding
/// form also hands the body the job's resource id.
macro_rules! routing_step {
    ($ty:ident, $name:literal, $args:ty, |$layout:ident, $a:ident| $body:block) => {
        routing_step!($ty, $name, $args, |$layout, $a, _resource| $body);
    };
    ($ty:ident, $name:literal, $args:ty, |$layout:ident, $a:ident, $rid:ident| $body:block) => {
        pub struct $ty;

        #[async_trait(?Send)]
        impl StepMethod for $ty {
            fn name(&self) -> &'static str {
                $name
            }

            fn effect(&self) -> EffectClass {
                EffectClass::Routing
            }

            async fn execute(
                &self,
                ctx: &StepContext<'_>,
                args: &Value,
            ) -> Result<Option<String>, StepError> {
                let $a: $args = parse_args($name, args)?;
                let $layout: HostLayout = ctx.layout.clone();
                let $rid: String = ctx.resource_id.to_string();
                blocking(move || $body).await
            }
        }
    };
}

/// A single name or a list of names.
#[derive(Deserialize)]
#[serde(untagged)]
enum Names {
    One(String),
    Many(Vec<String>),
}

impl Names {
    fn into_vec(self) -> Vec<String> {
        match self {
            Names::One(name) => vec![name],
            Names::Many(names) => names,
        }
    }
}

// ── Hosts ─────────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct AddHostArgs {
    host: String,
    target: String,
    #[serde(default)]
    certificate: BTreeMap<String, String>,
    #[serde(default)]
    codeserver: bool,
}

const CERTIFICATE_FILES: &[&str] = &["chain.pem", "fullchain.pem", "privkey.pem"];

routing_step!(AddHost, "add_host", AddHostArgs, |layout, args| {
    let dir = layout.host_path(&args.host)?;
    let map = BTreeMap::from([(args.host.clone(), args.target.clone())]);
    write_string_map(&dir.join("map.json"), &map)?;
    for (name, contents) in &args.certificate {
        if !CERTIFICATE_FILES.contains(&name.as_str()) {
            return Err(StepError::invalid(format!(
                "unexpected certificate file '{name}'"
            )));
        }
        write_atomic(&dir.join(name), contents.as_bytes())?;
    }
    let marker = dir.join("codeserver");
    if args.codeserver {
        write_atomic(&marker, b"")?;
    } else {
        remove_file_if_exists(&marker)?;
    }
    Ok(Some(format!("{} -> {}", args.host, args.target)))
});

#[derive(Deserialize)]
struct HostArgs {
    host: String,
}

routing_step!(RemoveHost, "remove_host", HostArgs, |layout, args| {
    let removed = remove_dir_if_exists(&layout.host_path(&args.host)?)?;
    Ok(Some(if removed {
        format!("removed host {}", args.host)
    } else {
        format!("host {} was not present", args.host)
    }))
});

// ── Upstreams ─────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct UpstreamArgs {
    upstream: String,
}

routing_step!(AddUpstream, "add_upstream", UpstreamArgs, |layout, args| {
    let dir = layout.upstream_path(&args.upstream)?;
    std::fs::create_dir_all(&dir)
        .map_err(|e| StepError::io(format!("creating {}", dir.display()), e))?;
    Ok(None)
});

#[derive(Deserialize)]
struct RenameUpstreamArgs {
    old: String,
    new: String,
}

routing_step!(RenameUpstream, "rename_upstream", RenameUpstreamArgs, |layout, args| {
    let old = layout.upstream_path(&args.old)?;
    let new = layout.upstream_path(&args.new)?;
    if !old.exists() && new.exists() {
        return Ok(Some(format!("{} already renamed", args.old)));
    }
    if new.exists() {
        return Err(StepError::invalid(format!(
            "upstream {} already exists",
            args.new
        )));
    }
    std::fs::rename(&old, &new)
        .map_err(|e| StepError::io(format!("renaming {}", old.display()), e))?;
    Ok(Some(format!("{} -> {}", args.old, args.new)))
});

#[derive(Deserialize)]
struct SiteArgs {
    upstream: String,
    site: Names,
}

/// Every other upstream holding a file for `site`.
fn conflicting_site_files(layout: &HostLayout, upstream: &str, site: &str) -> Result<Vec<PathBuf>, StepError> {
    let mut found = Vec::new();
    for other in list_entries(&layout.upstreams_directory(), true)? {
        if other == upstream {
            continue;
        }
        let file = layout.site_file(&other, site)?;
        if file.exists() {
            found.push(file);
        }
    }
    Ok(found)
}

/// A job whose resource is a site already routed on this host may only edit
/// that site's files. Bench and server jobs may name any site.
fn ensure_site_in_scope(layout: &HostLayout, resource_id: &str, site: &str) -> Result<(), StepError> {
    if site == resource_id {
        return Ok(());
    }
    let resource_is_site = list_entries(&layout.upstreams_directory(), true)?
        .iter()
        .any(|upstream| layout.site_file(upstream, resource_id).is_ok_and(|f| f.exists()));
    if resource_is_site {
        return Err(StepError::invalid(format!(
            "site '{site}' is outside this job's resource '{resource_id}'"
        )));
    }
    Ok(())
}

routing_step!(AddSiteToUpstream, "add_site_to_upstream", SiteArgs, |layout, args, resource| {
    let sites = args.site.into_vec();
    for site in &sites {
        ensure_site_in_scope(&layout, &resource, site)?;
    }
    let mut moved = 0;
    for site in sites {
        for conflict in conflicting_site_files(&layout, &args.upstream, &site)? {
            remove_file_if_exists(&conflict)?;
            moved += 1;
        }
        let file = layout.site_file(&args.upstream, &site)?;
        if !file.exists() {
            write_atomic(&file, b"")?;
        }
    }
    Ok(Some(format!(
        "added to {} ({moved} conflicting entries removed)",
        args.upstream
    )))
});

#[derive(Deserialize)]
struct RemoveSiteArgs {
    upstream: String,
    site: String,
    #[serde(default)]
    extra_domains: Vec<String>,
}

routing_step!(RemoveSiteFromUpstream, "remove_site_from_upstream", RemoveSiteArgs, |layout, args, resource| {
    ensure_site_in_scope(&layout, &resource, &args.site)?;
    let mut removed = 0;
    for name in std::iter::once(&args.site).chain(&args.extra_domains) {
        if remove_file_if_exists(&layout.site_file(&args.upstream, name)?)? {
            removed += 1;
        }
    }
    Ok(Some(format!("removed {removed} site files from {}", args.upstream)))
});

#[derive(Deserialize)]
struct SiteStatusArgs {
    upstream: String,
    site: String,
    status: String,
    #[serde(default)]
    extra_domains: Vec<String>,
}

routing_step!(UpdateSiteStatus, "update_site_status", SiteStatusArgs, |layout, args, resource| {
    ensure_site_in_scope(&layout, &resource, &args.site)?;
    for name in std::iter::once(&args.site).chain(&args.extra_domains) {
        write_atomic(&layout.site_file(&args.upstream, name)?, args.status.as_bytes())?;
    }
    Ok(Some(format!("{} is {}", args.site, args.status)))
});

#[derive(Deserialize)]
struct SecondariesArgs {
    primary: String,
    secondaries: Vec<String>,
}

/// Edits `upstreams/secondaries.json`, which every primary shares, so runs
/// are serialized host-wide rather than per resource.
pub struct SetUpstreamSecondaries;

#[async_trait(?Send)]
impl StepMethod for SetUpstreamSecondaries {
    fn name(&self) -> &'static str {
        "set_upstream_secondaries"
    }

    fn effect(&self) -> EffectClass {
        EffectClass::Routing
    }

    fn shared_lock(&self) -> Option<&'static str> {
        Some(SECONDARIES_LOCK)
    }

    async fn execute(&self, ctx: &StepContext<'_>, args: &Value) -> Result<Option<String>, StepError> {
        let args: SecondariesArgs = parse_args(self.name(), args)?;
        let layout = ctx.layout.clone();
        blocking(move || {
            layout.upstream_path(&args.primary)?;
            let path = layout.secondaries_file();
            let mut all = read_secondaries(&path)?;
            let count = args.secondaries.len();
            if args.secondaries.is_empty() {
                all.remove(&args.primary);
            } else {
                all.insert(args.primary.clone(), args.secondaries);
            }
            let body = serde_json::to_vec_pretty(&all)
                .map_err(|e| StepError::Command(format!("serializing secondaries: {e}")))?;
            write_atomic(&path, &body)?;
            Ok(Some(format!("{} has {count} secondaries", args.primary)))
        })
        .await
    }
}

// ── Redirects ─────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct SetupRedirectsArgs {
    hosts: Vec<String>,
    target: String,
}

routing_step!(SetupRedirects, "setup_redirects", SetupRedirectsArgs, |layout, args| {
    // The target itself must never redirect.
    let target_file = layout.host_path(&args.target)?.join("redirect.json");
    remove_file_if_exists(&target_file)?;
    let mut count = 0;
    for host in args.hosts.iter().filter(|h| **h != args.target) {
        let file = layout.host_path(host)?.join("redirect.json");
        let mut redirects = read_string_map(&file)?;
        redirects.insert(host.clone(), args.target.clone());
        write_string_map(&file, &redirects)?;
        count += 1;
    }
    Ok(Some(format!("{count} hosts redirect to {}", args.target)))
});

#[derive(Deserialize)]
struct HostsArgs {
    hosts: Vec<String>,
}

/// Remove redirects; hosts under the default domain lose their directory too.
pub struct RemoveRedirects {
    domain: Option<String>,
}

impl RemoveRedirects {
    pub fn new(domain: Option<String>) -> Self {
        Self { domain }
    }
}

#[async_trait(?Send)]
impl StepMethod for RemoveRedirects {
    fn name(&self) -> &'static str {
        "remove_redirects"
    }

    fn effect(&self) -> EffectClass {
        EffectClass::Routing
    }

    async fn execute(&self, ctx: &StepContext<'_>, args: &Value) -> Result<Option<String>, StepError> {
        let args: HostsArgs = parse_args(self.name(), args)?;
        let layout = ctx.layout.clone();
        let suffix = self.domain.as_ref().map(|d| format!(".{d}"));
        blocking(move || {
            for host in &args.hosts {
                let dir = layout.host_path(host)?;
                remove_file_if_exists(&dir.join("redirect.json"))?;
                if suffix.as_deref().is_some_and(|s| host.ends_with(s)) {
                    remove_dir_if_exists(&dir)?;
                }
            }
            Ok(Some(format!("removed {} redirects", args.hosts.len())))
        })
        .await
    }
}

// ── reload_proxy ──────────────────────────────────────────────────────────────

/// No mutation; exists so a job can request a reload explicitly.
pub struct ReloadProxy;

#[async_trait(?Send)]
impl StepMethod for ReloadProxy {
    fn name(&self) -> &'static str {
        "reload_proxy"
    }

    fn effect(&self) -> EffectClass {
        EffectClass::Routing
    }

    async fn execute(&self, _: &StepContext<'_>, _: &Value) -> Result<Option<String>, StepError> {
        Ok(Some("reload requested".to_string()))
    }
}
