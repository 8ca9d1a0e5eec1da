//! Policy engine: CORS / IP allow-deny / cache / rate-limit policies with
//! staged rollout (Shadow / AuditOnly / Enforce), spec §4.1.2.

pub mod cidr;

use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use serde::{Deserialize, Serialize};

use cidr::Cidr;

/// Staged-rollout mode: observe only, apply without rejecting, or apply and
/// reject on violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum PolicyMode {
    Shadow,
    AuditOnly,
    Enforce,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum PolicyType {
    Cors,
    IpAllow,
    IpDeny,
    CachePolicy,
    RateLimit,
}

#[derive(Debug, Clone)]
pub struct CorsConfig {
    pub origins: Vec<String>,
    pub methods: Vec<String>,
    pub headers: Vec<String>,
    pub exposed_headers: Vec<String>,
    pub allow_credentials: bool,
    pub max_age_seconds: u64,
}

#[derive(Debug, Clone)]
pub struct IpConfig {
    pub cidrs: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub ttl_seconds: u64,
    pub vary_by_host: bool,
    pub vary_by_query: Vec<String>,
    pub vary_by_headers: Vec<String>,
    pub vary_by_route_values: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub requests_per_second: u32,
    pub burst: u32,
}

#[derive(Debug, Clone)]
pub enum PolicyConfig {
    Cors(CorsConfig),
    IpAllow(IpConfig),
    IpDeny(IpConfig),
    CachePolicy(CacheConfig),
    RateLimit(RateLimitConfig),
}

impl PolicyConfig {
    pub fn policy_type(&self) -> PolicyType {
        match self {
            Self::Cors(_) => PolicyType::Cors,
            Self::IpAllow(_) => PolicyType::IpAllow,
            Self::IpDeny(_) => PolicyType::IpDeny,
            Self::CachePolicy(_) => PolicyType::CachePolicy,
            Self::RateLimit(_) => PolicyType::RateLimit,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PolicyEntry {
    pub id: String,
    pub mode: PolicyMode,
    pub enabled: bool,
    pub config: PolicyConfig,
}

impl PolicyEntry {
    pub fn policy_type(&self) -> PolicyType {
        self.config.policy_type()
    }
}

/// Problem+json shape returned on a 403 Enforce block (spec §6).
#[derive(Debug, Serialize)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub problem_type: String,
    pub title: String,
    pub status: u16,
    pub detail: String,
    pub instance: String,
}

impl ProblemDetails {
    pub fn forbidden(detail: impl Into<String>, instance: impl Into<String>) -> Self {
        Self {
            problem_type: "about:blank".to_string(),
            title: "Forbidden".to_string(),
            status: StatusCode::FORBIDDEN.as_u16(),
            detail: detail.into(),
            instance: instance.into(),
        }
    }
}

/// Outcome of evaluating every policy against one request.
#[derive(Debug, Default)]
pub struct PolicyEvaluation {
    pub blocked: Option<ProblemDetails>,
    pub cors_headers: Vec<(HeaderName, HeaderValue)>,
    pub cors_preflight_ok: bool,
    pub matched_cache_policy: Option<CacheConfig>,
}

pub type HeaderName = axum::http::HeaderName;

#[derive(Default)]
pub struct PolicyMetrics {
    pub evaluations_total: AtomicU64,
    pub violations_total: AtomicU64,
    pub blocks_total: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct PolicyMetricsSnapshot {
    pub evaluations_total: u64,
    pub violations_total: u64,
    pub blocks_total: u64,
}

impl PolicyMetrics {
    pub fn snapshot(&self) -> PolicyMetricsSnapshot {
        PolicyMetricsSnapshot {
            evaluations_total: self.evaluations_total.load(Ordering::Relaxed),
            violations_total: self.violations_total.load(Ordering::Relaxed),
            blocks_total: self.blocks_total.load(Ordering::Relaxed),
        }
    }
}

/// Holds the policy set for one route/tenant scope and evaluates requests
/// against it in the fixed order: IP-deny -> IP-allow -> CORS -> cache.
/// Rate-limit itself is enforced upstream by the governor middleware; this
/// engine only aggregates rejections (see [`super::rate_limit`]).
pub struct PolicyEngine {
    entries: Vec<PolicyEntry>,
    metrics: PolicyMetrics,
}

impl PolicyEngine {
    pub fn new(entries: Vec<PolicyEntry>) -> Self {
        Self { entries, metrics: PolicyMetrics::default() }
    }

    pub fn metrics(&self) -> &PolicyMetrics {
        &self.metrics
    }

    fn record_evaluation(&self, mode: PolicyMode) {
        self.metrics.evaluations_total.fetch_add(1, Ordering::Relaxed);
        let _ = mode;
    }

    fn record_violation(&self, mode: PolicyMode) {
        self.metrics.violations_total.fetch_add(1, Ordering::Relaxed);
        if mode == PolicyMode::Enforce {
            self.metrics.blocks_total.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Evaluate IP-deny -> IP-allow -> CORS -> cache-policy-selection, in
    /// that order, against `client_ip` and `headers`/`method`.
    pub fn evaluate(
        &self,
        client_ip: Option<IpAddr>,
        method: &Method,
        headers: &HeaderMap,
        instance: &str,
    ) -> PolicyEvaluation {
        let mut eval = PolicyEvaluation::default();

        // IP-deny
        for entry in self.entries.iter().filter(|e| e.enabled && e.policy_type() == PolicyType::IpDeny) {
            if let PolicyConfig::IpDeny(cfg) = &entry.config {
                self.record_evaluation(entry.mode);
                if let Some(ip) = client_ip {
                    let cidrs: Vec<Cidr> = cfg.cidrs.iter().filter_map(|c| Cidr::parse(c)).collect();
                    if cidr::matches_any(&cidrs, &ip) {
                        self.record_violation(entry.mode);
                        if entry.mode == PolicyMode::Enforce {
                            eval.blocked = Some(ProblemDetails::forbidden(
                                format!("{ip} is in deny list"),
                                instance.to_string(),
                            ));
                            return eval;
                        }
                    }
                }
            }
        }

        // IP-allow
        for entry in self.entries.iter().filter(|e| e.enabled && e.policy_type() == PolicyType::IpAllow) {
            if let PolicyConfig::IpAllow(cfg) = &entry.config {
                self.record_evaluation(entry.mode);
                if let Some(ip) = client_ip {
                    let cidrs: Vec<Cidr> = cfg.cidrs.iter().filter_map(|c| Cidr::parse(c)).collect();
                    if !cidr::matches_any(&cidrs, &ip) {
                        self.record_violation(entry.mode);
                        if entry.mode == PolicyMode::Enforce {
                            eval.blocked = Some(ProblemDetails::forbidden(
                                format!("{ip} is not in allow list"),
                                instance.to_string(),
                            ));
                            return eval;
                        }
                    }
                }
            }
        }

        // CORS
        for entry in self.entries.iter().filter(|e| e.enabled && e.policy_type() == PolicyType::Cors) {
            if let PolicyConfig::Cors(cfg) = &entry.config {
                self.record_evaluation(entry.mode);
                apply_cors(cfg, entry.mode, method, headers, &mut eval);
            }
        }

        // First enabled cache policy wins (spec §9 open question: explicit
        // "first enabled policy" behavior, not specificity-ordered).
        eval.matched_cache_policy = self
            .entries
            .iter()
            .find(|e| e.enabled && e.policy_type() == PolicyType::CachePolicy)
            .and_then(|e| match &e.config {
                PolicyConfig::CachePolicy(cfg) => Some(cfg.clone()),
                _ => None,
            });

        eval
    }
}

fn apply_cors(cfg: &CorsConfig, mode: PolicyMode, method: &Method, headers: &HeaderMap, eval: &mut PolicyEvaluation) {
    let origin = headers.get(axum::http::header::ORIGIN).and_then(|v| v.to_str().ok());
    let Some(origin) = origin else { return };

    let origin_allowed = cfg.origins.iter().any(|o| o == "*" || o == origin);
    if !origin_allowed {
        return;
    }

    let is_preflight = method == Method::OPTIONS && headers.contains_key("access-control-request-method");

    if is_preflight {
        let requested_method = headers
            .get("access-control-request-method")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        let method_allowed = cfg.methods.iter().any(|m| m.eq_ignore_ascii_case(requested_method));
        if mode != PolicyMode::Shadow {
            if method_allowed {
                eval.cors_preflight_ok = true;
            }
            push_cors_headers(cfg, origin, eval);
        }
    } else if mode != PolicyMode::Shadow {
        push_cors_headers(cfg, origin, eval);
    }
}

fn push_cors_headers(cfg: &CorsConfig, origin: &str, eval: &mut PolicyEvaluation) {
    let origin_value = if cfg.origins.iter().any(|o| o == "*") && !cfg.allow_credentials {
        "*".to_string()
    } else {
        origin.to_string()
    };
    eval.cors_headers.push((
        axum::http::header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_str(&origin_value).unwrap_or_else(|_| HeaderValue::from_static("*")),
    ));
    if cfg.allow_credentials {
        eval.cors_headers.push((
            axum::http::header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
            HeaderValue::from_static("true"),
        ));
    }
    if !cfg.methods.is_empty() {
        eval.cors_headers.push((
            axum::http::header::ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_str(&cfg.methods.join(", ")).unwrap_or_else(|_| HeaderValue::from_static("")),
        ));
    }
    if !cfg.headers.is_empty() {
        eval.cors_headers.push((
            axum::http::header::ACCESS_CONTROL_ALLOW_HEADERS,
            HeaderValue::from_str(&cfg.headers.join(", ")).unwrap_or_else(|_| HeaderValue::from_static("")),
        ));
    }
    if !cfg.exposed_headers.is_empty() {
        eval.cors_headers.push((
            axum::http::header::ACCESS_CONTROL_EXPOSE_HEADERS,
            HeaderValue::from_str(&cfg.exposed_headers.join(", ")).unwrap_or_else(|_| HeaderValue::from_static("")),
        ));
    }
    eval.cors_headers.push((
        axum::http::header::ACCESS_CONTROL_MAX_AGE,
        HeaderValue::from_str(&cfg.max_age_seconds.to_string()).unwrap_or_else(|_| HeaderValue::from_static("0")),
    ));
}

pub fn duration_from_ms(ms: u64) -> Duration {
    Duration::from_millis(ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip_deny_entry(cidr: &str, mode: PolicyMode) -> PolicyEntry {
        PolicyEntry {
            id: "deny-1".to_string(),
            mode,
            enabled: true,
            config: PolicyConfig::IpDeny(IpConfig { cidrs: vec![cidr.to_string()] }),
        }
    }

    #[test]
    fn scenario_policy_block_in_enforce_mode() {
        let engine = PolicyEngine::new(vec![ip_deny_entry("10.0.0.0/8", PolicyMode::Enforce)]);
        let eval = engine.evaluate(
            Some("10.1.2.3".parse().unwrap()),
            &Method::GET,
            &HeaderMap::new(),
            "/api/x",
        );
        let blocked = eval.blocked.expect("expected a block");
        assert_eq!(blocked.status, 403);
        assert!(blocked.detail.contains("10.1.2.3 is in deny list"));
        let snap = engine.metrics().snapshot();
        assert_eq!(snap.violations_total, 1);
        assert_eq!(snap.blocks_total, 1);
    }

    #[test]
    fn shadow_mode_never_blocks() {
        let engine = PolicyEngine::new(vec![ip_deny_entry("10.0.0.0/8", PolicyMode::Shadow)]);
        let eval = engine.evaluate(Some("10.1.2.3".parse().unwrap()), &Method::GET, &HeaderMap::new(), "/x");
        assert!(eval.blocked.is_none());
        let snap = engine.metrics().snapshot();
        assert_eq!(snap.violations_total, 1);
        assert_eq!(snap.blocks_total, 0);
    }

    #[test]
    fn audit_only_applies_behavior_but_never_blocks() {
        let mut headers = HeaderMap::new();
        headers.insert(axum::http::header::ORIGIN, HeaderValue::from_static("https://app.example.com"));
        let entry = PolicyEntry {
            id: "cors-1".to_string(),
            mode: PolicyMode::AuditOnly,
            enabled: true,
            config: PolicyConfig::Cors(CorsConfig {
                origins: vec!["https://app.example.com".to_string()],
                methods: vec!["GET".to_string()],
                headers: vec![],
                exposed_headers: vec![],
                allow_credentials: false,
                max_age_seconds: 600,
            }),
        };
        let engine = PolicyEngine::new(vec![entry]);
        let eval = engine.evaluate(None, &Method::GET, &headers, "/x");
        assert!(eval.blocked.is_none());
        assert!(!eval.cors_headers.is_empty());
    }

    #[test]
    fn cors_preflight_success_sets_ok_flag() {
        let mut headers = HeaderMap::new();
        headers.insert(axum::http::header::ORIGIN, HeaderValue::from_static("https://app.example.com"));
        headers.insert("access-control-request-method", HeaderValue::from_static("POST"));
        let entry = PolicyEntry {
            id: "cors-1".to_string(),
            mode: PolicyMode::Enforce,
            enabled: true,
            config: PolicyConfig::Cors(CorsConfig {
                origins: vec!["https://app.example.com".to_string()],
                methods: vec!["GET".to_string(), "POST".to_string()],
                headers: vec![],
                exposed_headers: vec![],
                allow_credentials: false,
                max_age_seconds: 600,
            }),
        };
        let engine = PolicyEngine::new(vec![entry]);
        let eval = engine.evaluate(None, &Method::OPTIONS, &headers, "/x");
        assert!(eval.cors_preflight_ok);
    }

    #[test]
    fn first_enabled_cache_policy_wins() {
        let c1 = CacheConfig { ttl_seconds: 10, vary_by_host: false, vary_by_query: vec![], vary_by_headers: vec![], vary_by_route_values: vec![] };
        let c2 = CacheConfig { ttl_seconds: 99, vary_by_host: false, vary_by_query: vec![], vary_by_headers: vec![], vary_by_route_values: vec![] };
        let entries = vec![
            PolicyEntry { id: "cache-1".to_string(), mode: PolicyMode::Enforce, enabled: true, config: PolicyConfig::CachePolicy(c1) },
            PolicyEntry { id: "cache-2".to_string(), mode: PolicyMode::Enforce, enabled: true, config: PolicyConfig::CachePolicy(c2) },
        ];
        let engine = PolicyEngine::new(entries);
        let eval = engine.evaluate(None, &Method::GET, &HeaderMap::new(), "/x");
        assert_eq!(eval.matched_cache_policy.unwrap().ttl_seconds, 10);
    }

    #[test]
    fn ip_allow_blocks_addresses_outside_list_in_enforce() {
        let entry = PolicyEntry {
            id: "allow-1".to_string(),
            mode: PolicyMode::Enforce,
            enabled: true,
            config: PolicyConfig::IpAllow(IpConfig { cidrs: vec!["192.168.0.0/16".to_string()] }),
        };
        let engine = PolicyEngine::new(vec![entry]);
        let eval = engine.evaluate(Some("8.8.8.8".parse().unwrap()), &Method::GET, &HeaderMap::new(), "/x");
        assert!(eval.blocked.is_some());
    }

    #[test]
    fn disabled_policy_is_skipped_entirely() {
        let entry = PolicyEntry {
            id: "deny-1".to_string(),
            mode: PolicyMode::Enforce,
            enabled: false,
            config: PolicyConfig::IpDeny(IpConfig { cidrs: vec!["0.0.0.0/0".to_string()] }),
        };
        let engine = PolicyEngine::new(vec![entry]);
        let eval = engine.evaluate(Some("1.2.3.4".parse().unwrap()), &Method::GET, &HeaderMap::new(), "/x");
        assert!(eval.blocked.is_none());
        assert_eq!(engine.metrics().snapshot().evaluations_total, 0);
    }
}
