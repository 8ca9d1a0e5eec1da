//! Batteries-included service assembly: loads config, starts tracing, wires
//! [`AppState`] (and every background worker it owns) and attaches the
//! health/readiness endpoints every service needs, then hands back a
//! [`Router`] ready for [`Server::serve`].
//!
//! Routes are only ever attached through [`VersionedRoutes`], which can only
//! be produced by [`VersionedApiBuilder::build_routes`] — there is no way to
//! register an unversioned route through this builder.

use axum::Router;
use tokio::sync::watch;

use crate::config::Config;
use crate::error::Result;
use crate::gateway::PolicyEntry;
use crate::state::AppState;

#[cfg(feature = "database")]
use sqlx::PgPool;

#[cfg(feature = "cache")]
use deadpool_redis::Pool as RedisPool;

/// Opaque wrapper around versioned routes. Can only be constructed by
/// [`VersionedApiBuilder::build_routes`] or left at its default (health and
/// readiness only).
pub enum VersionedRoutes {
    /// Routes that have not yet been bound to [`AppState`].
    WithoutState(Router<()>),
    /// Routes already carrying the health/readiness endpoints.
    WithState(Router<AppState>),
}

impl VersionedRoutes {
    pub(crate) fn from_router(router: Router<()>) -> Self {
        Self::WithoutState(router)
    }
}

impl Default for VersionedRoutes {
    fn default() -> Self {
        use axum::routing::get;

        let health_router: Router<AppState> = Router::new()
            .route("/health", get(crate::health::health))
            .route("/ready", get(crate::health::readiness))
            .route("/metrics/pools", get(crate::health::pool_metrics));

        Self::WithState(health_router)
    }
}

/// Assembles [`AppState`], the background workers it owns, and the final
/// router. Connection pools are the caller's responsibility to build (e.g.
/// via `sqlx::PgPoolOptions`/`deadpool_redis::Config`) and hand in — this
/// builder only wires them into state and starts the workers that depend on
/// them.
#[derive(Default)]
pub struct ServiceBuilder {
    config: Option<Config>,
    routes: Option<VersionedRoutes>,
    #[cfg(feature = "database")]
    db_pool: Option<PgPool>,
    #[cfg(feature = "cache")]
    redis_pool: Option<RedisPool>,
    policy_entries: Vec<PolicyEntry>,
}

impl ServiceBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the service configuration. Falls back to [`Config::load`] if omitted.
    pub fn with_config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Attach versioned routes. Defaults to health/readiness-only if omitted.
    pub fn with_routes(mut self, routes: VersionedRoutes) -> Self {
        self.routes = Some(routes);
        self
    }

    #[cfg(feature = "database")]
    pub fn with_db_pool(mut self, pool: PgPool) -> Self {
        self.db_pool = Some(pool);
        self
    }

    #[cfg(feature = "cache")]
    pub fn with_redis_pool(mut self, pool: RedisPool) -> Self {
        self.redis_pool = Some(pool);
        self
    }

    /// Policy entries for the gateway's [`crate::gateway::PolicyEngine`].
    pub fn with_policy(mut self, entries: Vec<PolicyEntry>) -> Self {
        self.policy_entries = entries;
        self
    }

    /// Build the service: loads config if missing, initializes tracing,
    /// builds [`AppState`] (spawning every background worker the config
    /// calls for), and attaches health/readiness routes.
    pub async fn build(self) -> Result<ActonService> {
        let config = match self.config {
            Some(config) => config,
            None => Config::load()?,
        };

        if let Err(e) = crate::observability::init_tracing(&config) {
            eprintln!("warning: failed to initialize tracing: {e}");
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut state_builder = AppState::builder().config(config.clone()).policy(self.policy_entries);
        #[cfg(feature = "database")]
        if let Some(pool) = self.db_pool {
            state_builder = state_builder.db_pool(pool);
        }
        #[cfg(feature = "cache")]
        if let Some(pool) = self.redis_pool {
            state_builder = state_builder.redis_pool(pool);
        }
        let state = state_builder.build(shutdown_rx).await?;

        let routes = self.routes.unwrap_or_default();
        let app = match routes {
            VersionedRoutes::WithState(router) => router.with_state(state.clone()),
            VersionedRoutes::WithoutState(router) => {
                use axum::routing::get;
                let health_router: Router<AppState> = Router::new()
                    .route("/health", get(crate::health::health))
                    .route("/ready", get(crate::health::readiness));
                health_router.fallback_service(router).with_state(state.clone())
            }
        };

        #[cfg(feature = "jwt")]
        let app = {
            match crate::middleware::jwt::JwtAuth::new(&config.jwt, config.service.name.clone(), config.service.environment) {
                Ok(jwt_auth) => app.layer(axum::middleware::from_fn_with_state(jwt_auth, crate::middleware::jwt::JwtAuth::middleware)),
                Err(e) => {
                    tracing::warn!(error = %e, "jwt configuration invalid, skipping jwt middleware");
                    app
                }
            }
        };

        // TLS, where used, terminates upstream of this process, so HSTS is
        // never applicable here regardless of `security_headers.hsts`.
        let app = crate::middleware::apply_security_headers(app, &config.security_headers, false);

        Ok(ActonService { config, app, shutdown_tx })
    }
}

/// Final assembled service. The only operation is [`ActonService::serve`] —
/// the router inside cannot be extended further, so every route a caller
/// wants must already have gone through [`VersionedRoutes`].
pub struct ActonService {
    config: Config,
    app: Router,
    shutdown_tx: watch::Sender<bool>,
}

impl ActonService {
    pub async fn serve(self) -> Result<()> {
        let server = crate::server::Server::new(self.config.clone());
        let result = server.serve(self.app).await;
        let _ = self.shutdown_tx.send(true);
        result
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versioned_routes_default_is_with_state() {
        let routes = VersionedRoutes::default();
        assert!(matches!(routes, VersionedRoutes::WithState(_)));
    }
}
