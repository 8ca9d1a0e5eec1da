//! Reverse proxy: route-by-path-prefix dispatch to upstream services,
//! tenant/correlation/trace header forwarding, WebSocket upgrade passthrough,
//! and per-route timeout/body-limit enforcement (spec §4.1.4).

use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Request, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};

use crate::config::{GatewayConfig, RouteConfig};
use crate::error::{Error, Result};
use crate::tenant::TENANT_HEADER;

use super::enrichment::CORRELATION_HEADER;

/// Headers stripped before forwarding upstream — hop-by-hop per RFC 7230
/// §6.1, plus `host` (the upstream client sets its own).
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
];

/// Resolves the configured route for a request path. Matches the
/// longest configured `path_prefix` that prefixes the request path,
/// consistent with the gateway's route-base dispatch by first path segment.
pub fn match_route<'a>(config: &'a GatewayConfig, path: &str) -> Option<&'a RouteConfig> {
    config
        .routes
        .iter()
        .filter(|r| path.starts_with(r.path_prefix.as_str()))
        .max_by_key(|r| r.path_prefix.len())
}

pub fn route_timeout(config: &GatewayConfig, route: &RouteConfig) -> Duration {
    Duration::from_secs(route.timeout_secs.unwrap_or(config.default_route_timeout_secs))
}

pub fn route_body_limit_bytes(config: &GatewayConfig, route: &RouteConfig) -> usize {
    route.body_limit_mb.unwrap_or(config.default_body_limit_mb) * 1024 * 1024
}

/// Build the upstream URI for `path`/`query` against `route.upstream_base_url`.
pub fn upstream_uri(route: &RouteConfig, path: &str, query: Option<&str>) -> Result<Uri> {
    let base = route.upstream_base_url.trim_end_matches('/');
    let mut full = format!("{base}{path}");
    if let Some(q) = query {
        full.push('?');
        full.push_str(q);
    }
    full.parse::<Uri>().map_err(|e| Error::validation(format!("invalid upstream uri: {e}")))
}

fn forwardable_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in headers.iter() {
        if HOP_BY_HOP.contains(&name.as_str()) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

/// Attach tenant id and correlation id headers for the upstream hop.
pub fn with_gateway_headers(mut headers: HeaderMap, tenant: Option<&str>, correlation_id: &str) -> HeaderMap {
    if let Some(tenant) = tenant {
        if let Ok(value) = HeaderValue::from_str(tenant) {
            headers.insert(HeaderName::from_static(TENANT_HEADER), value);
        }
    }
    if let Ok(value) = HeaderValue::from_str(correlation_id) {
        headers.insert(HeaderName::from_static(CORRELATION_HEADER), value);
    }
    headers
}

/// Forward one non-WebSocket request to the matched route's upstream,
/// applying the route's timeout.
pub async fn forward_request(
    client: &reqwest::Client,
    route: &RouteConfig,
    config: &GatewayConfig,
    method: reqwest::Method,
    uri: &Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    let timeout = route_timeout(config, route);
    let forward_headers = forwardable_headers(&headers);

    let mut reqwest_headers = reqwest::header::HeaderMap::new();
    for (name, value) in forward_headers.iter() {
        if let (Ok(n), Ok(v)) = (
            reqwest::header::HeaderName::from_bytes(name.as_str().as_bytes()),
            reqwest::header::HeaderValue::from_bytes(value.as_bytes()),
        ) {
            reqwest_headers.append(n, v);
        }
    }

    let resp = client
        .request(method, uri.to_string())
        .headers(reqwest_headers)
        .body(body)
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| {
            if e.is_timeout() {
                Error::upstream_unavailable(StatusCode::GATEWAY_TIMEOUT, format!("upstream timed out: {e}"))
            } else {
                Error::upstream_unavailable(StatusCode::BAD_GATEWAY, format!("upstream unreachable: {e}"))
            }
        })?;

    let status = StatusCode::from_u16(resp.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut builder = Response::builder().status(status);
    for (name, value) in resp.headers().iter() {
        if HOP_BY_HOP.contains(&name.as_str()) {
            continue;
        }
        builder = builder.header(name.as_str(), value.as_bytes());
    }
    let body_bytes = resp.bytes().await.map_err(|e| Error::upstream_unavailable(StatusCode::BAD_GATEWAY, format!("reading upstream body: {e}")))?;

    builder
        .body(Body::from(body_bytes))
        .map_err(|e| Error::Http(Box::new(e)))
        .map(IntoResponse::into_response)
}

/// Upgrade an inbound WebSocket request and relay frames to/from the
/// upstream WebSocket at `upstream_uri`. Runs until either side closes.
pub async fn proxy_websocket(ws: WebSocketUpgrade, upstream_uri: Uri) -> Response {
    ws.on_upgrade(move |socket| async move {
        if let Err(err) = relay_websocket(socket, upstream_uri).await {
            tracing::warn!(error = %err, "websocket proxy relay ended with an error");
        }
    })
}

async fn relay_websocket(client_socket: WebSocket, upstream_uri: Uri) -> Result<()> {
    let upstream_ws_url = to_ws_scheme(&upstream_uri);
    let (upstream, _) = tokio_tungstenite::connect_async(upstream_ws_url)
        .await
        .map_err(|e| Error::upstream_unavailable(StatusCode::BAD_GATEWAY, format!("upstream websocket connect failed: {e}")))?;

    let (mut client_tx, mut client_rx) = client_socket.split();
    let (mut upstream_tx, mut upstream_rx) = upstream.split();

    let client_to_upstream = async {
        while let Some(Ok(msg)) = client_rx.next().await {
            let forwarded = match msg {
                Message::Text(t) => tokio_tungstenite::tungstenite::Message::Text(t.to_string().into()),
                Message::Binary(b) => tokio_tungstenite::tungstenite::Message::Binary(b),
                Message::Ping(p) => tokio_tungstenite::tungstenite::Message::Ping(p),
                Message::Pong(p) => tokio_tungstenite::tungstenite::Message::Pong(p),
                Message::Close(_) => break,
            };
            if upstream_tx.send(forwarded).await.is_err() {
                break;
            }
        }
    };

    let upstream_to_client = async {
        while let Some(Ok(msg)) = upstream_rx.next().await {
            let forwarded = match msg {
                tokio_tungstenite::tungstenite::Message::Text(t) => Message::Text(t.to_string().into()),
                tokio_tungstenite::tungstenite::Message::Binary(b) => Message::Binary(b),
                tokio_tungstenite::tungstenite::Message::Ping(p) => Message::Ping(p),
                tokio_tungstenite::tungstenite::Message::Pong(p) => Message::Pong(p),
                tokio_tungstenite::tungstenite::Message::Close(_) => break,
                tokio_tungstenite::tungstenite::Message::Frame(_) => continue,
            };
            if client_tx.send(forwarded).await.is_err() {
                break;
            }
        }
    };

    tokio::select! {
        _ = client_to_upstream => {},
        _ = upstream_to_client => {},
    }
    Ok(())
}

fn to_ws_scheme(uri: &Uri) -> String {
    let s = uri.to_string();
    if let Some(rest) = s.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = s.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        s
    }
}

/// Whether this request is a WebSocket upgrade.
pub fn is_upgrade_request(headers: &HeaderMap) -> bool {
    headers
        .get(axum::http::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}

/// Per-route circuit breaker registry. One breaker per `path_prefix`, so a
/// failing upstream only degrades requests routed to it.
#[cfg(feature = "resilience")]
pub struct RouteCircuitBreakers {
    config: crate::middleware::ResilienceConfig,
    breakers: dashmap::DashMap<String, std::sync::Arc<crate::middleware::CircuitBreaker>>,
}

#[cfg(feature = "resilience")]
impl RouteCircuitBreakers {
    pub fn new(config: crate::middleware::ResilienceConfig) -> Self {
        Self { config, breakers: dashmap::DashMap::new() }
    }

    pub fn get(&self, route: &RouteConfig) -> std::sync::Arc<crate::middleware::CircuitBreaker> {
        self.breakers
            .entry(route.path_prefix.clone())
            .or_insert_with(|| std::sync::Arc::new(crate::middleware::CircuitBreaker::new(self.config.clone())))
            .clone()
    }
}

/// Forward a request through a per-route circuit breaker. While the breaker
/// for `route` is open, the upstream is never called — callers should fall
/// back to [`super::cache::CachedResponse::into_stale_envelope`] when this
/// returns [`Error::UpstreamUnavailable`] (spec §7).
#[cfg(feature = "resilience")]
pub async fn forward_with_circuit_breaker(
    client: &reqwest::Client,
    route: &RouteConfig,
    config: &GatewayConfig,
    method: reqwest::Method,
    uri: &Uri,
    headers: HeaderMap,
    body: Bytes,
    breakers: &RouteCircuitBreakers,
) -> Result<Response> {
    let breaker = breakers.get(route);

    if breaker.is_open() {
        return Err(Error::upstream_unavailable(
            StatusCode::SERVICE_UNAVAILABLE,
            format!("circuit breaker open for route {}", route.path_prefix),
        ));
    }

    match forward_request(client, route, config, method, uri, headers, body).await {
        Ok(resp) => {
            breaker.record_success();
            Ok(resp)
        }
        Err(e) => {
            breaker.record_failure();
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gateway_config() -> GatewayConfig {
        GatewayConfig {
            base_url: "https://gw.example.com".to_string(),
            default_route_timeout_secs: 30,
            default_body_limit_mb: 10,
            routes: vec![
                RouteConfig {
                    path_prefix: "/db".to_string(),
                    upstream_base_url: "http://db-service.internal".to_string(),
                    timeout_secs: Some(5),
                    body_limit_mb: None,
                },
                RouteConfig {
                    path_prefix: "/db/admin".to_string(),
                    upstream_base_url: "http://db-admin.internal".to_string(),
                    timeout_secs: None,
                    body_limit_mb: Some(1),
                },
            ],
        }
    }

    #[test]
    fn longest_prefix_wins() {
        let cfg = gateway_config();
        let route = match_route(&cfg, "/db/admin/reset").unwrap();
        assert_eq!(route.upstream_base_url, "http://db-admin.internal");
    }

    #[test]
    fn shorter_prefix_used_when_nested_not_matched() {
        let cfg = gateway_config();
        let route = match_route(&cfg, "/db/collections").unwrap();
        assert_eq!(route.upstream_base_url, "http://db-service.internal");
    }

    #[test]
    fn no_match_returns_none() {
        let cfg = gateway_config();
        assert!(match_route(&cfg, "/unknown").is_none());
    }

    #[test]
    fn route_timeout_falls_back_to_default() {
        let cfg = gateway_config();
        let route = &cfg.routes[1];
        assert_eq!(route_timeout(&cfg, route), Duration::from_secs(30));
    }

    #[test]
    fn route_timeout_uses_override() {
        let cfg = gateway_config();
        let route = &cfg.routes[0];
        assert_eq!(route_timeout(&cfg, route), Duration::from_secs(5));
    }

    #[test]
    fn body_limit_converts_mb_to_bytes() {
        let cfg = gateway_config();
        assert_eq!(route_body_limit_bytes(&cfg, &cfg.routes[1]), 1024 * 1024);
        assert_eq!(route_body_limit_bytes(&cfg, &cfg.routes[0]), 10 * 1024 * 1024);
    }

    #[test]
    fn hop_by_hop_headers_are_stripped() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("keep-alive"));
        headers.insert("x-custom", HeaderValue::from_static("value"));
        let forwarded = forwardable_headers(&headers);
        assert!(!forwarded.contains_key("connection"));
        assert!(forwarded.contains_key("x-custom"));
    }

    #[test]
    fn gateway_headers_attach_tenant_and_correlation() {
        let headers = with_gateway_headers(HeaderMap::new(), Some("acme"), "corr-1");
        assert_eq!(headers.get(TENANT_HEADER).unwrap(), "acme");
        assert_eq!(headers.get(CORRELATION_HEADER).unwrap(), "corr-1");
    }

    #[test]
    fn ws_scheme_conversion() {
        assert_eq!(to_ws_scheme(&"http://x.example/a".parse().unwrap()), "ws://x.example/a");
        assert_eq!(to_ws_scheme(&"https://x.example/a".parse().unwrap()), "wss://x.example/a");
    }

    #[test]
    fn upgrade_header_detected() {
        let mut headers = HeaderMap::new();
        headers.insert(axum::http::header::UPGRADE, HeaderValue::from_static("websocket"));
        assert!(is_upgrade_request(&headers));
        assert!(!is_upgrade_request(&HeaderMap::new()));
    }

    #[cfg(feature = "resilience")]
    #[tokio::test]
    async fn open_breaker_short_circuits_without_calling_upstream() {
        use crate::middleware::ResilienceConfig;

        let cfg = gateway_config();
        let route = cfg.routes[0].clone();
        let breakers = RouteCircuitBreakers::new(ResilienceConfig {
            circuit_breaker_min_requests: 1,
            circuit_breaker_threshold: 0.1,
            ..ResilienceConfig::default()
        });

        // First call fails against an address nothing listens on, tripping the breaker.
        let client = reqwest::Client::new();
        let uri: Uri = "http://127.0.0.1:1/unreachable".parse().unwrap();
        let first = forward_with_circuit_breaker(
            &client,
            &route,
            &cfg,
            reqwest::Method::GET,
            &uri,
            HeaderMap::new(),
            Bytes::new(),
            &breakers,
        )
        .await;
        assert!(first.is_err());

        let second = forward_with_circuit_breaker(
            &client,
            &route,
            &cfg,
            reqwest::Method::GET,
            &uri,
            HeaderMap::new(),
            Bytes::new(),
            &breakers,
        )
        .await;
        assert!(matches!(second, Err(Error::UpstreamUnavailable { .. })));
    }
}
