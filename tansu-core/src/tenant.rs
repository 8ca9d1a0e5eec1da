//! Tenant identity resolution.
//!
//! `TenantContext` resolves a tenant slug from the inbound request (header,
//! path, or subdomain), normalizes it, and derives the per-tenant Postgres
//! database name. Path wins over subdomain; the header is trusted only when
//! it arrives from an upstream/internal hop (gateway enrichment strips it
//! from anything coming directly off the public listener before trusting it
//! for authorization — see [`crate::gateway::enrichment`]).

use axum::http::{HeaderMap, Uri};

/// Header carrying a tenant resolved by an upstream hop. Never trust this
/// header when it originates from a browser-facing listener.
pub const TENANT_HEADER: &str = "x-tansu-tenant";

/// Postgres database name prefix for every tenant database.
pub const TENANT_DB_PREFIX: &str = "tansu_tenant_";

/// Hostnames that never carry tenant information via subdomain.
const RESERVED_HOSTS: &[&str] = &["localhost", "www"];

/// Resolved tenant identity for a single request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantContext {
    /// Normalized slug, e.g. `acme_corp` (no `tansu_tenant_` prefix).
    slug: String,
}

impl TenantContext {
    /// Build a context from an already-normalized slug. Returns `None` if
    /// normalization leaves nothing behind.
    pub fn new(raw: &str) -> Option<Self> {
        let slug = normalize(raw)?;
        Some(Self { slug })
    }

    /// Resolve from request parts: path segment (`/t/{tenant}/...` convention)
    /// takes precedence over the tenant header, which takes precedence over
    /// a subdomain on `host`.
    pub fn resolve(headers: &HeaderMap, uri: &Uri, host: Option<&str>) -> Option<Self> {
        if let Some(from_path) = tenant_from_path(uri.path()) {
            return Self::new(&from_path);
        }
        if let Some(from_header) = headers.get(TENANT_HEADER).and_then(|v| v.to_str().ok()) {
            return Self::new(from_header);
        }
        if let Some(host) = host {
            if let Some(from_subdomain) = tenant_from_host(host) {
                return Self::new(&from_subdomain);
            }
        }
        None
    }

    /// Normalized slug with no prefix, e.g. `acme_corp`.
    pub fn slug(&self) -> &str {
        &self.slug
    }

    /// Per-tenant Postgres database name, e.g. `tansu_tenant_acme_corp`.
    pub fn database_name(&self) -> String {
        format!("{TENANT_DB_PREFIX}{}", self.slug)
    }
}

impl std::fmt::Display for TenantContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.slug)
    }
}

/// Lowercase, replace every byte outside `[a-z0-9_]` with `_`, collapse
/// runs of `_`, and trim leading/trailing `_`. Returns `None` if nothing
/// survives.
fn normalize(raw: &str) -> Option<String> {
    let mut out = String::with_capacity(raw.len());
    let mut last_was_underscore = false;
    for ch in raw.chars().flat_map(|c| c.to_lowercase()) {
        let mapped = if ch.is_ascii_alphanumeric() { ch } else { '_' };
        if mapped == '_' {
            if last_was_underscore {
                continue;
            }
            last_was_underscore = true;
        } else {
            last_was_underscore = false;
        }
        out.push(mapped);
    }
    let trimmed = out.trim_matches('_');
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// `/t/{tenant}/...` → `Some(tenant)`. Any other path shape yields `None`.
fn tenant_from_path(path: &str) -> Option<String> {
    let mut segments = path.trim_start_matches('/').splitn(3, '/');
    if segments.next()? != "t" {
        return None;
    }
    segments.next().map(str::to_string)
}

/// First label of `host`, honoring the §4.1.1 rule: only when `host` has at
/// least 3 labels and the first label is neither reserved nor a bare IP.
fn tenant_from_host(host: &str) -> Option<String> {
    let host = host.split(':').next().unwrap_or(host);
    if host.parse::<std::net::IpAddr>().is_ok() {
        return None;
    }
    if RESERVED_HOSTS.contains(&host) {
        return None;
    }
    let labels: Vec<&str> = host.split('.').collect();
    if labels.len() < 3 {
        return None;
    }
    let first = labels[0];
    if first.is_empty() || RESERVED_HOSTS.contains(&first) {
        return None;
    }
    Some(first.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn normalizes_mixed_case_and_punctuation() {
        let ctx = TenantContext::new("Acme-Corp!!").unwrap();
        assert_eq!(ctx.slug(), "acme_corp");
        assert_eq!(ctx.database_name(), "tansu_tenant_acme_corp");
    }

    #[test]
    fn rejects_empty_after_normalization() {
        assert!(TenantContext::new("---").is_none());
    }

    #[test]
    fn path_wins_over_header_and_subdomain() {
        let mut headers = HeaderMap::new();
        headers.insert(TENANT_HEADER, HeaderValue::from_static("from-header"));
        let uri: Uri = "/t/from-path/api/x".parse().unwrap();
        let ctx = TenantContext::resolve(&headers, &uri, Some("from-subdomain.tansu.example")).unwrap();
        assert_eq!(ctx.slug(), "from_path");
    }

    #[test]
    fn header_wins_over_subdomain_when_no_path_segment() {
        let mut headers = HeaderMap::new();
        headers.insert(TENANT_HEADER, HeaderValue::from_static("from-header"));
        let uri: Uri = "/api/x".parse().unwrap();
        let ctx = TenantContext::resolve(&headers, &uri, Some("from-subdomain.tansu.example")).unwrap();
        assert_eq!(ctx.slug(), "from_header");
    }

    #[test]
    fn falls_back_to_subdomain() {
        let headers = HeaderMap::new();
        let uri: Uri = "/api/x".parse().unwrap();
        let ctx = TenantContext::resolve(&headers, &uri, Some("acme.tansu.example")).unwrap();
        assert_eq!(ctx.slug(), "acme");
    }

    #[test]
    fn ignores_reserved_hosts_and_ip_literals() {
        let headers = HeaderMap::new();
        let uri: Uri = "/api/x".parse().unwrap();
        assert!(TenantContext::resolve(&headers, &uri, Some("localhost")).is_none());
        assert!(TenantContext::resolve(&headers, &uri, Some("www.tansu.example")).is_none());
        assert!(TenantContext::resolve(&headers, &uri, Some("127.0.0.1")).is_none());
        assert!(TenantContext::resolve(&headers, &uri, Some("192.168.1.10:8080")).is_none());
    }

    #[test]
    fn bare_host_with_no_subdomain_structure_yields_none() {
        let headers = HeaderMap::new();
        let uri: Uri = "/api/x".parse().unwrap();
        assert!(TenantContext::resolve(&headers, &uri, Some("tansu")).is_none());
    }

    #[test]
    fn two_label_host_is_not_a_subdomain_tenant() {
        let headers = HeaderMap::new();
        let uri: Uri = "/api/x".parse().unwrap();
        assert!(TenantContext::resolve(&headers, &uri, Some("acme.com")).is_none());
    }
}
