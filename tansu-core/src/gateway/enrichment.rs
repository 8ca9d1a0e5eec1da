//! Request enrichment: correlation id, tenant resolution with source
//! tracking, route-base extraction, and the logger scope (spec §4.1.1).

use axum::http::{HeaderMap, HeaderValue, Uri};
use uuid::Uuid;

use crate::tenant::TenantContext;

pub const CORRELATION_HEADER: &str = "x-correlation-id";

/// Known first-path-segment route families the gateway dispatches on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteBase {
    Dashboard,
    Identity,
    Db,
    Storage,
    Admin,
    Health,
    Other(String),
}

impl RouteBase {
    pub fn from_path(path: &str) -> Self {
        let first = path.trim_start_matches('/').split('/').next().unwrap_or("");
        match first {
            "dashboard" => Self::Dashboard,
            "identity" => Self::Identity,
            "db" => Self::Db,
            "storage" => Self::Storage,
            "admin" => Self::Admin,
            "health" => Self::Health,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Dashboard => "dashboard",
            Self::Identity => "identity",
            Self::Db => "db",
            Self::Storage => "storage",
            Self::Admin => "admin",
            Self::Health => "health",
            Self::Other(s) => s.as_str(),
        }
    }
}

/// Where the resolved tenant came from, per spec §4.1.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TenantSource {
    Path,
    Subdomain,
    Both,
    None,
}

/// The result of enriching one inbound request.
#[derive(Debug, Clone)]
pub struct EnrichedRequest {
    pub correlation_id: String,
    pub tenant: Option<TenantContext>,
    pub tenant_source: TenantSource,
    pub route_base: RouteBase,
}

impl EnrichedRequest {
    pub fn resolve(headers: &HeaderMap, uri: &Uri, host: Option<&str>) -> Self {
        let correlation_id = headers
            .get(CORRELATION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let route_base = RouteBase::from_path(uri.path());

        let path_tenant = tenant_from_path(uri.path());
        let subdomain_tenant = host.and_then(tenant_from_subdomain);

        let (tenant, source) = match (&path_tenant, &subdomain_tenant) {
            (Some(p), Some(_)) => (Some(p.clone()), TenantSource::Both),
            (Some(p), None) => (Some(p.clone()), TenantSource::Path),
            (None, Some(s)) => (Some(s.clone()), TenantSource::Subdomain),
            (None, None) => (None, TenantSource::None),
        };

        let tenant = tenant.and_then(|raw| TenantContext::new(&raw));

        Self { correlation_id, tenant, tenant_source: source, route_base }
    }

    /// The header value to echo on the response — always present, even when
    /// the inbound request didn't supply one (a fresh id was minted).
    pub fn correlation_header_value(&self) -> HeaderValue {
        HeaderValue::from_str(&self.correlation_id).unwrap_or_else(|_| HeaderValue::from_static("invalid"))
    }
}

/// `/t/{id}/...` as the leading path segment.
fn tenant_from_path_leading(path: &str) -> Option<String> {
    let mut segments = path.trim_start_matches('/').splitn(3, '/');
    if segments.next()? != "t" {
        return None;
    }
    segments.next().map(str::to_string)
}

/// `/{routebase}/t/{id}/...` — tenant nested one segment in under the route
/// base, e.g. `/db/t/acme/collections`.
fn tenant_from_path_nested(path: &str) -> Option<String> {
    let mut segments = path.trim_start_matches('/').splitn(4, '/');
    let _route_base = segments.next()?;
    if segments.next()? != "t" {
        return None;
    }
    segments.next().map(str::to_string)
}

fn tenant_from_path(path: &str) -> Option<String> {
    tenant_from_path_leading(path).or_else(|| tenant_from_path_nested(path))
}

const RESERVED_HOSTS: &[&str] = &["localhost", "www"];

/// Subdomain tenant, honoring the §4.1.1 rule: only when `host` has at
/// least 3 labels and the first label is neither `www` nor a bare IP.
fn tenant_from_subdomain(host: &str) -> Option<String> {
    let host = host.split(':').next().unwrap_or(host);
    if host.parse::<std::net::IpAddr>().is_ok() {
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

    #[test]
    fn correlation_id_is_echoed_when_supplied() {
        let mut headers = HeaderMap::new();
        headers.insert(CORRELATION_HEADER, HeaderValue::from_static("unit-test-corr"));
        let uri: Uri = "/".parse().unwrap();
        let enriched = EnrichedRequest::resolve(&headers, &uri, None);
        assert_eq!(enriched.correlation_id, "unit-test-corr");
    }

    #[test]
    fn correlation_id_is_minted_when_absent() {
        let headers = HeaderMap::new();
        let uri: Uri = "/".parse().unwrap();
        let enriched = EnrichedRequest::resolve(&headers, &uri, None);
        assert!(!enriched.correlation_id.is_empty());
    }

    #[test]
    fn scenario_tenant_path_wins_with_source_both() {
        let headers = HeaderMap::new();
        let uri: Uri = "/t/pathTenant/db/api".parse().unwrap();
        let enriched = EnrichedRequest::resolve(&headers, &uri, Some("contoso.example.com"));
        assert_eq!(enriched.tenant.unwrap().slug(), "pathtenant");
        assert_eq!(enriched.tenant_source, TenantSource::Both);
    }

    #[test]
    fn scenario_reserved_host_ignored_yields_none() {
        let headers = HeaderMap::new();
        let uri: Uri = "/db/health/live".parse().unwrap();
        let enriched = EnrichedRequest::resolve(&headers, &uri, Some("www.example.com"));
        assert!(enriched.tenant.is_none());
        assert_eq!(enriched.tenant_source, TenantSource::None);
    }

    #[test]
    fn nested_route_base_tenant_path_resolves() {
        let headers = HeaderMap::new();
        let uri: Uri = "/db/t/acme/collections".parse().unwrap();
        let enriched = EnrichedRequest::resolve(&headers, &uri, None);
        assert_eq!(enriched.tenant.unwrap().slug(), "acme");
        assert_eq!(enriched.tenant_source, TenantSource::Path);
        assert_eq!(enriched.route_base, RouteBase::Db);
    }

    #[test]
    fn subdomain_only_when_no_path_tenant() {
        let headers = HeaderMap::new();
        let uri: Uri = "/api/x".parse().unwrap();
        let enriched = EnrichedRequest::resolve(&headers, &uri, Some("acme.tansu.example"));
        assert_eq!(enriched.tenant.unwrap().slug(), "acme");
        assert_eq!(enriched.tenant_source, TenantSource::Subdomain);
    }

    #[test]
    fn route_base_from_unknown_segment_is_other() {
        let rb = RouteBase::from_path("/custom/thing");
        assert_eq!(rb, RouteBase::Other("custom".to_string()));
    }
}
