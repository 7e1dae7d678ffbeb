//! Routing state model and the pure nginx configuration renderer.
//!
//! `render` is total: it always produces the whole configuration from the
//! whole `HostState`, with deterministic ordering so identical state renders
//! byte-identical output.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use sha2::{Digest, Sha512};

// ── State model ──────────────────────────────────────────────────────────────

/// Routing status stored in an upstream's site file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SiteStatus {
    Active,
    Deactivated,
    Suspended,
    SuspendedSaas,
}

impl SiteStatus {
    /// Unknown or empty contents mean the site is served normally.
    pub fn parse(contents: &str) -> Self {
        match contents.trim() {
            "deactivated" => SiteStatus::Deactivated,
            "suspended" => SiteStatus::Suspended,
            "suspended_saas" => SiteStatus::SuspendedSaas,
            _ => SiteStatus::Active,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SiteStatus::Active => "active",
            SiteStatus::Deactivated => "deactivated",
            SiteStatus::Suspended => "suspended",
            SiteStatus::SuspendedSaas => "suspended_saas",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteRoute {
    pub name: String,
    pub status: SiteStatus,
}

/// One upstream directory: an app server and the sites it serves.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Upstream {
    pub sites: Vec<SiteRoute>,
    /// Additional servers sharing this upstream's load.
    pub secondaries: Vec<String>,
}

/// One host directory (`hosts/<host>`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostEntry {
    /// `map.json`: requested host name → site name (or `$host`).
    pub map: BTreeMap<String, String>,
    /// `redirect.json`: source host → target host.
    pub redirects: BTreeMap<String, String>,
    pub codeserver: bool,
}

/// Everything the renderer needs, as loaded from the nginx directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostState {
    pub hosts: BTreeMap<String, HostEntry>,
    pub upstreams: BTreeMap<String, Upstream>,
}

/// Values that do not come from the host directories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderSettings {
    /// Absolute nginx directory; certificate paths are rendered below it.
    pub nginx_directory: String,
    pub tls_protocols: Option<String>,
}

/// Stable upstream block name: first 16 hex chars of SHA-512 of the directory name.
pub fn upstream_hash(name: &str) -> String {
    let digest = Sha512::digest(name.as_bytes());
    let mut hex = format!("{digest:x}");
    hex.truncate(16);
    hex
}

fn is_wildcard(host: &str) -> bool {
    host.contains('*')
}

// ── Rendering ────────────────────────────────────────────────────────────────

const HEADER: &str = "# Rendered by press-agent from hosts/ and upstreams/. Do not edit.\n";

/// Render the complete proxy configuration.
pub fn render(state: &HostState, settings: &RenderSettings) -> String {
    let mut out = String::from(HEADER);
    render_upstreams(&mut out, state);
    render_site_map(&mut out, state);
    render_upstream_map(&mut out, state);
    render_default_servers(&mut out, settings);
    for (host, entry) in &state.hosts {
        if !entry.map.is_empty() && !entry.redirects.contains_key(host) {
            render_host_server(&mut out, host, entry, settings);
        }
    }
    render_redirect_servers(&mut out, state, settings);
    out
}

fn render_upstreams(out: &mut String, state: &HostState) {
    for (name, upstream) in &state.upstreams {
        let _ = writeln!(out, "\nupstream {} {{", upstream_hash(name));
        let _ = writeln!(out, "    server {name};");
        for secondary in &upstream.secondaries {
            let _ = writeln!(out, "    server {secondary};");
        }
        let _ = writeln!(out, "    keepalive 32;\n}}");
    }
}

fn render_site_map(out: &mut String, state: &HostState) {
    out.push_str("\nmap $host $press_site {\n    hostnames;\n    default \"\";\n");
    for (host, entry) in &state.hosts {
        for (from, to) in &entry.map {
            // `default` in a wildcard map.json means "the host directory itself"
            let key = if from == "default" { host } else { from };
            let _ = writeln!(out, "    {} {};", quote(key), quote(to));
        }
    }
    out.push_str("}\n");
}

fn render_upstream_map(out: &mut String, state: &HostState) {
    out.push_str("\nmap $press_site $press_upstream {\n    default \"\";\n");
    // Duplicates across upstreams are kept so `nginx -t` reports the conflict.
    for (name, upstream) in &state.upstreams {
        let hash = upstream_hash(name);
        let mut sites: Vec<&SiteRoute> = upstream.sites.iter().collect();
        sites.sort_by(|a, b| a.name.cmp(&b.name));
        for site in sites {
            let target = match site.status {
                SiteStatus::Active => hash.as_str(),
                other => other.as_str(),
            };
            let _ = writeln!(out, "    {} {};", quote(&site.name), target);
        }
    }
    out.push_str("}\n");
}

fn render_default_servers(out: &mut String, settings: &RenderSettings) {
    let _ = write!(
        out,
        "\nserver {{\n    listen 80 default_server;\n    listen [::]:80 default_server;\n\n    \
         location ^~ /.well-known/acme-challenge/ {{\n        root {}/acme;\n    }}\n\n    \
         location / {{\n        return 301 https://$host$request_uri;\n    }}\n}}\n",
        settings.nginx_directory
    );
    out.push_str(
        "\nserver {\n    listen 443 ssl default_server;\n    listen [::]:443 ssl default_server;\n    \
         ssl_reject_handshake on;\n}\n",
    );
}

fn render_tls(out: &mut String, cert_host: &str, settings: &RenderSettings) {
    let dir = format!("{}/hosts/{cert_host}", settings.nginx_directory);
    let _ = writeln!(out, "    ssl_certificate {dir}/fullchain.pem;");
    let _ = writeln!(out, "    ssl_certificate_key {dir}/privkey.pem;");
    let _ = writeln!(out, "    ssl_trusted_certificate {dir}/chain.pem;");
    if let Some(protocols) = settings.tls_protocols.as_deref().filter(|p| !p.trim().is_empty()) {
        let _ = writeln!(out, "    ssl_protocols {};", protocols.trim());
    }
}

fn render_host_server(out: &mut String, host: &str, entry: &HostEntry, settings: &RenderSettings) {
    let mut names: Vec<&str> = vec![host];
    for from in entry.map.keys() {
        if from != "default" && from != host {
            names.push(from);
        }
    }
    let _ = writeln!(
        out,
        "\nserver {{\n    listen 443 ssl;\n    listen [::]:443 ssl;\n    http2 on;\n    server_name {};\n",
        names.join(" ")
    );
    render_tls(out, host, settings);
    out.push_str(
        "\n    location / {\n        \
         if ($press_upstream = \"\") { return 404; }\n        \
         if ($press_upstream = deactivated) { return 503; }\n        \
         if ($press_upstream = suspended) { return 402; }\n        \
         if ($press_upstream = suspended_saas) { return 402; }\n\n        \
         proxy_set_header Host $press_site;\n        \
         proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;\n        \
         proxy_set_header X-Forwarded-Proto https;\n        \
         proxy_http_version 1.1;\n",
    );
    if entry.codeserver {
        out.push_str(
            "        proxy_set_header Upgrade $http_upgrade;\n        \
             proxy_set_header Connection \"upgrade\";\n",
        );
    } else {
        out.push_str("        proxy_set_header Connection \"\";\n");
    }
    out.push_str("        proxy_pass http://$press_upstream;\n    }\n}\n");
}

fn render_redirect_servers(out: &mut String, state: &HostState, settings: &RenderSettings) {
    for (host, entry) in &state.hosts {
        for (from, to) in &entry.redirects {
            // Redirects filed under a wildcard directory reuse its certificate.
            let cert_host = if is_wildcard(host) || from == host { host } else { from };
            let _ = writeln!(
                out,
                "\nserver {{\n    listen 443 ssl;\n    listen [::]:443 ssl;\n    server_name {from};\n"
            );
            render_tls(out, cert_host, settings);
            let _ = writeln!(out, "\n    return 301 https://{to}$request_uri;\n}}");
        }
    }
}

/// Quote a map key or value unless it is a plain token or variable.
fn quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '*' | '$'))
    {
        value.to_string()
    } else {
        format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
    }
}
