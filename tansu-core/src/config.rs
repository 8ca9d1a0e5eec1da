//! Configuration management using Figment
//!
//! Configuration is loaded from multiple sources with the following
//! precedence (highest to lowest):
//! 1. Environment variables (prefix: `TANSU_`)
//! 2. `./config.toml` in the current working directory
//! 3. Built-in defaults

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::Result;

/// Deployment environment. Controls audience-check strictness (see
/// [`crate::jwt`]) and whether extension-reconciliation failures abort
/// startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Development,
    Staging,
    Production,
}

impl Environment {
    pub fn is_production(&self) -> bool {
        matches!(self, Environment::Production)
    }
}

impl Default for Environment {
    fn default() -> Self {
        Environment::Development
    }
}

impl std::str::FromStr for Environment {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s.to_lowercase().as_str() {
            "prod" | "production" => Environment::Production,
            "staging" | "stage" => Environment::Staging,
            _ => Environment::Development,
        })
    }
}

/// Top-level configuration, one section per subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub service: ServiceConfig,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub audit: AuditConfig,
    pub telemetry: TelemetryConfig,
    pub log_reporter: LogReporterConfig,
    pub storage: StorageConfig,
    pub provisioning: ProvisioningConfig,
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub jwt: JwtConfig,
    #[serde(default)]
    pub security_headers: SecurityHeadersConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Service/resource name used in the JWT audience check, e.g. `tansu.storage`.
    pub name: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub environment: Environment,
}

/// JWT claim-verification configuration (resource-server side only; this
/// crate never issues tokens).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwtConfig {
    #[serde(default = "default_jwt_key_path")]
    pub public_key_path: PathBuf,
    #[serde(default = "default_jwt_algorithm")]
    pub algorithm: String,
    #[serde(default)]
    pub issuer: Option<String>,
}

impl Default for JwtConfig {
    fn default() -> Self {
        Self { public_key_path: default_jwt_key_path(), algorithm: default_jwt_algorithm(), issuer: None }
    }
}

/// Postgres connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
}

impl DatabaseConfig {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }
}

/// Redis configuration: pub/sub bus for cache-version events and the key
/// prefix for the gateway's dynamic output cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    pub url: String,
    #[serde(default = "default_redis_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_cache_version_channel")]
    pub cache_version_channel: String,
    #[serde(default = "default_cache_key_prefix")]
    pub output_cache_key_prefix: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
}

/// Audit pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    #[serde(default = "default_audit_capacity")]
    pub channel_capacity: usize,
    #[serde(default = "default_audit_batch_size")]
    pub batch_size: usize,
    /// `drop-on-full` (default) or `wait` (intended for tests only).
    #[serde(default = "default_audit_backpressure")]
    pub backpressure: AuditBackpressure,
    #[serde(default = "default_audit_retention_days")]
    pub retention_days: u32,
    /// Fixed Postgres advisory-lock id serializing migrations across instances.
    #[serde(default = "default_advisory_lock_id")]
    pub advisory_lock_id: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuditBackpressure {
    DropOnFull,
    Wait,
}

/// Telemetry ingestion + admin configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default = "default_telemetry_capacity")]
    pub channel_capacity: usize,
    /// Constant-time-compared bearer key for fleet submissions.
    pub admin_api_key: String,
    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: u64,
}

/// Log-reporter agent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogReporterConfig {
    #[serde(default = "default_report_interval_secs")]
    pub report_interval_secs: u64,
    #[serde(default = "default_jitter_min_secs")]
    pub jitter_min_secs: u64,
    #[serde(default = "default_jitter_max_secs")]
    pub jitter_max_secs: u64,
    #[serde(default = "default_initial_stagger_secs")]
    pub initial_stagger_secs: u64,
    pub main_server_url: String,
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
    /// Minimum severity that is eligible for reporting at all.
    #[serde(default = "default_severity_threshold")]
    pub severity_threshold: u8,
    /// Only consider records emitted within this many minutes of the dispatch tick.
    #[serde(default = "default_window_minutes")]
    pub window_minutes: i64,
    /// Category prefixes always forwarded at `Warning`; anything else at
    /// `Warning` is subject to `warning_sampling_percent`.
    #[serde(default)]
    pub warning_category_allowlist: Vec<String>,
    #[serde(default = "default_warning_sampling_percent")]
    pub warning_sampling_percent: f64,
    #[serde(default = "default_max_items")]
    pub max_items: usize,
    #[serde(default)]
    pub pseudonymize_tenant: bool,
    #[serde(default)]
    pub pseudonymization_secret: Option<String>,
    #[serde(default)]
    pub bearer_token: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Object storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub root_path: PathBuf,
    #[serde(default)]
    pub public_base_url: Option<String>,
    #[serde(default = "default_default_quota_bytes")]
    pub default_tenant_quota_bytes: u64,
    #[serde(default = "default_min_part_size_bytes")]
    pub min_part_size_bytes: u64,
    #[serde(default)]
    pub max_part_size_bytes: Option<u64>,
    #[serde(default = "default_multipart_timeout_secs")]
    pub multipart_inactivity_timeout_secs: u64,
    #[serde(default = "default_multipart_cleanup_interval_secs")]
    pub multipart_cleanup_interval_secs: u64,
    /// HMAC key used to sign presigned URLs; rotating this invalidates outstanding URLs.
    pub presign_secret: String,
    #[serde(default = "default_compression_allowlist")]
    pub compression_content_types: Vec<String>,
    #[serde(default = "default_brotli_level")]
    pub brotli_level: u32,
    #[serde(default = "default_transform_cache_max_entries")]
    pub transform_cache_max_entries: usize,
    #[serde(default = "default_transform_cache_ttl_secs")]
    pub transform_cache_ttl_secs: u64,
    #[serde(default = "default_max_image_dimension")]
    pub max_width: u32,
    #[serde(default = "default_max_image_dimension")]
    pub max_height: u32,
    #[serde(default = "default_max_total_pixels")]
    pub max_total_pixels: u64,
}

/// Tenant provisioning configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisioningConfig {
    #[serde(default = "default_extension_allowlist")]
    pub extension_allowlist: Vec<String>,
    pub pool_admin_base_url: String,
    #[serde(default)]
    pub pool_admin_user: Option<String>,
    #[serde(default)]
    pub pool_admin_password: Option<String>,
    pub expected_schema_version: i64,
    /// `SKIP_EXTENSION_UPDATE=1` bypasses the startup reconciliation pass entirely.
    #[serde(default)]
    pub skip_extension_update: bool,
}

/// Gateway routing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub base_url: String,
    #[serde(default = "default_route_timeout_secs")]
    pub default_route_timeout_secs: u64,
    #[serde(default = "default_body_limit_mb")]
    pub default_body_limit_mb: usize,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    pub path_prefix: String,
    pub upstream_base_url: String,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub body_limit_mb: Option<usize>,
}

/// Response security headers applied to every route.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityHeadersConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub hsts: bool,
    #[serde(default = "default_hsts_max_age_secs")]
    pub hsts_max_age_secs: u64,
    #[serde(default = "default_true")]
    pub hsts_include_subdomains: bool,
    #[serde(default)]
    pub hsts_preload: bool,
    #[serde(default = "default_true")]
    pub x_content_type_options: bool,
    #[serde(default = "default_x_frame_options")]
    pub x_frame_options: String,
    #[serde(default = "default_true")]
    pub x_xss_protection: bool,
    #[serde(default = "default_referrer_policy")]
    pub referrer_policy: String,
    #[serde(default)]
    pub permissions_policy: Option<String>,
}

impl Default for SecurityHeadersConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            hsts: true,
            hsts_max_age_secs: default_hsts_max_age_secs(),
            hsts_include_subdomains: true,
            hsts_preload: false,
            x_content_type_options: true,
            x_frame_options: default_x_frame_options(),
            x_xss_protection: true,
            referrer_policy: default_referrer_policy(),
            permissions_policy: None,
        }
    }
}

// ----------------------------------------------------------------------
// Defaults
// ----------------------------------------------------------------------

fn default_port() -> u16 { 8080 }
fn default_log_level() -> String { "info".to_string() }
fn default_jwt_key_path() -> PathBuf { PathBuf::from("./keys/jwt-public.pem") }
fn default_jwt_algorithm() -> String { "RS256".to_string() }
fn default_max_connections() -> u32 { 50 }
fn default_min_connections() -> u32 { 5 }
fn default_connection_timeout() -> u64 { 10 }
fn default_redis_max_connections() -> usize { 20 }
fn default_cache_version_channel() -> String { "tansu:cache-version".to_string() }
fn default_cache_key_prefix() -> String { "tansu:output-cache:".to_string() }
fn default_max_retries() -> u32 { 5 }
fn default_retry_delay_secs() -> u64 { 2 }
fn default_audit_capacity() -> usize { 10_000 }
fn default_audit_batch_size() -> usize { 256 }
fn default_audit_backpressure() -> AuditBackpressure { AuditBackpressure::DropOnFull }
fn default_audit_retention_days() -> u32 { 90 }
fn default_advisory_lock_id() -> i64 { 0x7473_4175_6469_7431 } // "tsAudit1" in hex-ish, fixed/stable
fn default_telemetry_capacity() -> usize { 10_000 }
fn default_session_ttl_secs() -> u64 { 3600 }
/// Default report interval: 60 minutes, expressed in seconds.
fn default_report_interval_secs() -> u64 { 60 * 60 }
fn default_jitter_min_secs() -> u64 { 5 }
fn default_jitter_max_secs() -> u64 { 30 }
fn default_initial_stagger_secs() -> u64 { 10 }
fn default_buffer_capacity() -> usize { 5_000 }
/// `Warning` severity; see the log reporter's severity scale (Trace=0..Critical=5).
fn default_severity_threshold() -> u8 { 3 }
fn default_window_minutes() -> i64 { 60 }
fn default_warning_sampling_percent() -> f64 { 10.0 }
fn default_max_items() -> usize { 50 }
fn default_true() -> bool { true }
fn default_default_quota_bytes() -> u64 { 10 * 1024 * 1024 * 1024 }
fn default_min_part_size_bytes() -> u64 { 5 * 1024 * 1024 }
/// Default multipart inactivity timeout: 1 hour.
fn default_multipart_timeout_secs() -> u64 { 3600 }
/// Default multipart sweeper interval: 10 minutes.
fn default_multipart_cleanup_interval_secs() -> u64 { 600 }
fn default_compression_allowlist() -> Vec<String> {
    vec!["application/json".to_string(), "text/plain".to_string(), "text/csv".to_string()]
}
fn default_brotli_level() -> u32 { 4 }
fn default_transform_cache_max_entries() -> usize { 1_000 }
fn default_transform_cache_ttl_secs() -> u64 { 300 }
fn default_max_image_dimension() -> u32 { 4096 }
fn default_max_total_pixels() -> u64 { 16_000_000 }
/// Default allowlist: `citus, vector`; `pg_trgm` is added at reconciliation
/// time only when the extension is available on the target Postgres build.
fn default_extension_allowlist() -> Vec<String> {
    vec!["citus".to_string(), "vector".to_string()]
}
fn default_route_timeout_secs() -> u64 { 30 }
fn default_body_limit_mb() -> usize { 10 }
/// Default HSTS max-age: 1 year, in seconds.
fn default_hsts_max_age_secs() -> u64 { 365 * 24 * 60 * 60 }
fn default_x_frame_options() -> String { "DENY".to_string() }
fn default_referrer_policy() -> String { "strict-origin-when-cross-origin".to_string() }

impl Config {
    /// Load configuration from `./config.toml` + environment, applying
    /// `TANSU_`-prefixed overrides and the handful of bare environment
    /// variables the platform recognizes without that prefix.
    pub fn load() -> Result<Self> {
        Self::load_from("config.toml")
    }

    pub fn load_from(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let mut figment = Figment::new();

        let path = path.as_ref();
        if path.exists() {
            tracing::info!("loading configuration from {}", path.display());
            figment = figment.merge(Toml::file(path));
        }

        figment = figment.merge(Env::prefixed("TANSU_").split("__"));

        // Bare environment variables the platform recognizes verbatim
        // (no TANSU_ prefix), layered as explicit overrides.
        if let Ok(env) = std::env::var("TANSU_ENVIRONMENT") {
            figment = figment.merge(Serialized::default("service.environment", env.to_lowercase()));
        }
        if let Ok(skip) = std::env::var("SKIP_EXTENSION_UPDATE") {
            let skip = skip == "1" || skip.eq_ignore_ascii_case("true");
            figment = figment.merge(Serialized::default("provisioning.skip_extension_update", skip));
        }
        if let Ok(user) = std::env::var("PGCAT_ADMIN_USER") {
            figment = figment.merge(Serialized::default("provisioning.pool_admin_user", user));
        }
        if let Ok(pass) = std::env::var("PGCAT_ADMIN_PASSWORD") {
            figment = figment.merge(Serialized::default("provisioning.pool_admin_password", pass));
        }
        if let Ok(base_url) = std::env::var("PUBLIC_BASE_URL") {
            figment = figment.merge(Serialized::default("storage.public_base_url", base_url));
        }
        if let Ok(base_url) = std::env::var("GATEWAY_BASE_URL") {
            figment = figment.merge(Serialized::default("gateway.base_url", base_url));
        }

        Ok(figment.extract()?)
    }

    pub fn database_url(&self) -> &str {
        &self.database.url
    }

    pub fn redis_url(&self) -> &str {
        &self.redis.url
    }
}
