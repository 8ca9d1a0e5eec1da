//! Application state: a single-owner handle per subsystem, built once at
//! startup and cloned cheaply (everything inside is already `Arc`- or
//! pool-backed). No ambient globals — every background worker and request
//! handler receives the handles it needs explicitly (spec §5).

use std::sync::Arc;
use std::time::Duration;

use crate::audit::AuditHandle;
use crate::cache_version::TenantCacheVersion;
use crate::config::Config;
use crate::error::Result;
use crate::gateway::{PolicyEngine, PolicyEntry};
use crate::log_reporter::LogBuffer;
use crate::storage::ObjectStore;
use crate::telemetry::{IngestionQueue, SessionStore};

#[cfg(feature = "database")]
use sqlx::PgPool;

#[cfg(feature = "cache")]
use deadpool_redis::Pool as RedisPool;

/// Shared application state threaded through gateway, provisioning, audit,
/// telemetry and storage handlers alike.
#[derive(Clone)]
pub struct AppState {
    config: Arc<Config>,

    #[cfg(feature = "database")]
    db_pool: Option<PgPool>,

    #[cfg(feature = "cache")]
    redis_pool: Option<RedisPool>,

    cache_version: TenantCacheVersion,
    policy: Arc<PolicyEngine>,
    storage: ObjectStore,
    telemetry_ingest: IngestionQueue,
    telemetry_sessions: SessionStore,
    log_buffer: LogBuffer,

    audit: Option<Arc<AuditHandle>>,
}

impl AppState {
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[cfg(feature = "database")]
    pub fn db(&self) -> Option<&PgPool> {
        self.db_pool.as_ref()
    }

    #[cfg(feature = "cache")]
    pub fn redis(&self) -> Option<&RedisPool> {
        self.redis_pool.as_ref()
    }

    pub fn cache_version(&self) -> &TenantCacheVersion {
        &self.cache_version
    }

    pub fn policy(&self) -> &PolicyEngine {
        &self.policy
    }

    pub fn storage(&self) -> &ObjectStore {
        &self.storage
    }

    pub fn telemetry_ingest(&self) -> &IngestionQueue {
        &self.telemetry_ingest
    }

    pub fn telemetry_sessions(&self) -> &SessionStore {
        &self.telemetry_sessions
    }

    pub fn log_buffer(&self) -> &LogBuffer {
        &self.log_buffer
    }

    /// `None` when the `database` feature is disabled or the audit writer
    /// was never started — audit ingestion becomes a silent no-op then.
    pub fn audit(&self) -> Option<&AuditHandle> {
        self.audit.as_deref()
    }

    pub fn builder() -> AppStateBuilder {
        AppStateBuilder::default()
    }
}

/// Builds [`AppState`] and starts every background worker the configuration
/// calls for (audit writer, cache-version subscriber, multipart sweeper,
/// telemetry persistence, log reporter dispatch). Returns a
/// [`tokio::sync::watch::Sender`] the caller signals to shut every worker
/// down together.
#[derive(Default)]
pub struct AppStateBuilder {
    config: Option<Config>,
    #[cfg(feature = "database")]
    db_pool: Option<PgPool>,
    #[cfg(feature = "cache")]
    redis_pool: Option<RedisPool>,
    policy_entries: Vec<PolicyEntry>,
}

impl AppStateBuilder {
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    #[cfg(feature = "database")]
    pub fn db_pool(mut self, pool: PgPool) -> Self {
        self.db_pool = Some(pool);
        self
    }

    #[cfg(feature = "cache")]
    pub fn redis_pool(mut self, pool: RedisPool) -> Self {
        self.redis_pool = Some(pool);
        self
    }

    pub fn policy(mut self, entries: Vec<PolicyEntry>) -> Self {
        self.policy_entries = entries;
        self
    }

    /// Build the state and spawn every background worker. `shutdown` is a
    /// single shared signal every worker observes; the caller fires it
    /// (`tokio::sync::watch::Sender::send(true)`) during graceful shutdown.
    pub async fn build(self, shutdown: tokio::sync::watch::Receiver<bool>) -> Result<AppState> {
        let config = self.config.ok_or_else(|| crate::error::Error::Internal("configuration not provided to AppStateBuilder".to_string()))?;

        let storage = ObjectStore::new(config.storage.root_path.clone());
        {
            let root = config.storage.root_path.clone();
            let inactivity_timeout = Duration::from_secs(config.storage.multipart_inactivity_timeout_secs);
            let cleanup_interval = Duration::from_secs(config.storage.multipart_cleanup_interval_secs);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                crate::storage::run_sweeper(root, inactivity_timeout, cleanup_interval, shutdown).await;
            });
        }

        let (telemetry_ingest, telemetry_rx) = IngestionQueue::new(config.telemetry.channel_capacity);
        let telemetry_sessions = SessionStore::new(Duration::from_secs(config.telemetry.session_ttl_secs));

        let log_buffer = LogBuffer::new(config.log_reporter.buffer_capacity);
        {
            let log_cfg = config.log_reporter.clone();
            let buffer = log_buffer.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                crate::log_reporter::run_dispatcher(log_cfg, buffer, shutdown).await;
            });
        }

        let cache_version = TenantCacheVersion::new();

        #[cfg(feature = "cache")]
        {
            let cache_version = cache_version.clone();
            let redis_url = config.redis.url.clone();
            let channel = config.redis.cache_version_channel.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                crate::cache_version::run_subscriber(redis_url, channel, cache_version, shutdown).await;
            });
        }

        #[cfg(feature = "database")]
        let audit = if let Some(pool) = &self.db_pool {
            let handle = crate::audit::init(&config.audit, pool.clone());
            {
                let pool = pool.clone();
                let retention_days = config.audit.retention_days;
                let mut retention_shutdown = shutdown.clone();
                tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            _ = tokio::time::sleep(Duration::from_secs(24 * 3600)) => {
                                match crate::audit::retention::run_once(&pool, retention_days, crate::audit::RetentionMode::HardDelete, &[]).await {
                                    Ok(outcome) => tracing::info!(affected = outcome.affected, "audit: retention sweep complete"),
                                    Err(e) => tracing::error!(error = %e, "audit: retention sweep failed"),
                                }
                            }
                            _ = retention_shutdown.changed() => { if *retention_shutdown.borrow() { return; } }
                        }
                    }
                });
            }
            {
                let pool = pool.clone();
                let worker_shutdown = shutdown.clone();
                tokio::spawn(async move {
                    crate::telemetry::run_worker(pool, telemetry_rx, worker_shutdown).await;
                });
            }
            Some(Arc::new(handle))
        } else {
            drop(telemetry_rx);
            None
        };

        #[cfg(not(feature = "database"))]
        drop(telemetry_rx);

        Ok(AppState {
            config: Arc::new(config),
            #[cfg(feature = "database")]
            db_pool: self.db_pool,
            #[cfg(feature = "cache")]
            redis_pool: self.redis_pool,
            cache_version,
            policy: Arc::new(PolicyEngine::new(self.policy_entries)),
            storage,
            telemetry_ingest,
            telemetry_sessions,
            log_buffer,
            #[cfg(feature = "database")]
            audit,
            #[cfg(not(feature = "database"))]
            audit: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::*;

    fn test_config() -> Config {
        Config {
            service: ServiceConfig { name: "tansu.storage".to_string(), port: 8080, log_level: "info".to_string(), environment: Environment::Development },
            database: DatabaseConfig { url: "postgres://localhost/test".to_string(), max_connections: 5, min_connections: 1, connection_timeout_secs: 5, max_retries: 3, retry_delay_secs: 2 },
            redis: RedisConfig { url: "redis://localhost".to_string(), max_connections: 5, cache_version_channel: "cache-version".to_string(), output_cache_key_prefix: "oc:".to_string(), max_retries: 3, retry_delay_secs: 2 },
            audit: AuditConfig { channel_capacity: 100, batch_size: 10, backpressure: AuditBackpressure::DropOnFull, retention_days: 90, advisory_lock_id: 1 },
            telemetry: TelemetryConfig { channel_capacity: 100, admin_api_key: "key".to_string(), session_ttl_secs: 3600 },
            log_reporter: LogReporterConfig {
                report_interval_secs: 3600, jitter_min_secs: 5, jitter_max_secs: 30, initial_stagger_secs: 10,
                main_server_url: String::new(), buffer_capacity: 100,
                severity_threshold: 3, window_minutes: 60, warning_category_allowlist: vec![],
                warning_sampling_percent: 10.0, max_items: 50, pseudonymize_tenant: false,
                pseudonymization_secret: None, bearer_token: None, enabled: true,
            },
            storage: StorageConfig {
                root_path: std::env::temp_dir().join("tansu-state-test"),
                public_base_url: None, default_tenant_quota_bytes: 0, min_part_size_bytes: 5 * 1024 * 1024,
                max_part_size_bytes: None, multipart_inactivity_timeout_secs: 3600, multipart_cleanup_interval_secs: 600,
                presign_secret: "secret".to_string(), compression_content_types: vec![], brotli_level: 4,
                transform_cache_max_entries: 100, transform_cache_ttl_secs: 300, max_width: 4096, max_height: 4096, max_total_pixels: 16_000_000,
            },
            provisioning: ProvisioningConfig {
                pool_admin_base_url: "http://localhost".to_string(), pool_admin_user: Some("admin".to_string()),
                pool_admin_password: Some("admin".to_string()), extension_allowlist: vec![], expected_schema_version: 1, skip_extension_update: true,
            },
            gateway: GatewayConfig { base_url: "http://localhost".to_string(), default_route_timeout_secs: 30, default_body_limit_mb: 10, routes: vec![] },
            jwt: JwtConfig::default(),
            security_headers: SecurityHeadersConfig::default(),
        }
    }

    #[tokio::test]
    async fn builder_produces_a_state_without_a_database() {
        let (_tx, rx) = tokio::sync::watch::channel(false);
        let state = AppStateBuilder::default().config(test_config()).build(rx).await.unwrap();
        assert_eq!(state.config().service.name, "tansu.storage");
        assert!(state.audit().is_none());
    }
}
