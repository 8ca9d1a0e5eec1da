//! # tansu-core
//!
//! Core library for a multi-tenant cloud platform: tenant-aware reverse
//! proxy and policy engine (C1), tenant provisioning and schema
//! reconciliation (C2), outbox-backed cache invalidation (C3), an audit
//! pipeline with keyset queries and retention (C4), telemetry ingestion and
//! an admin surface (C5), a log-reporting agent (C6), and an object storage
//! core (C7).
//!
//! ## Example
//!
//! ```rust,no_run
//! use tansu_core::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     // Load configuration
//!     let config = Config::load()?;
//!
//!     // Initialize tracing
//!     init_tracing(&config)?;
//!
//!     // Build application state
//!     let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//!     let state = AppState::builder()
//!         .config(config.clone())
//!         .build(shutdown_rx)
//!         .await?;
//!
//!     // Create router
//!     let app = Router::new()
//!         .route("/health", get(health))
//!         .route("/ready", get(readiness))
//!         .with_state(state);
//!
//!     // Run server
//!     Server::new(config)
//!         .serve(app)
//!         .await?;
//!
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod ids;
pub mod middleware;
pub mod health;
pub mod pool_health;
pub mod responses;
pub mod server;
pub mod service_builder;
pub mod state;
pub mod versioning;

#[cfg(feature = "database")]
pub mod database;

#[cfg(feature = "cache")]
pub mod cache;

pub mod observability;

/// Shared primitives: tenant resolution, content hashing/HMAC, and the
/// cache-version counter the gateway's dynamic cache keys off of.
pub mod tenant;
pub mod hashing;
pub mod cache_version;
pub mod outbox;

/// C1 — tenant-aware reverse proxy & policy engine.
pub mod gateway;

/// C2 — tenant provisioning & schema reconciliation.
pub mod provisioning;

/// C4 — audit pipeline.
pub mod audit;

/// C5 — telemetry ingestion & admin surface.
pub mod telemetry;

/// C6 — log reporter agent.
pub mod log_reporter;

/// C7 — object storage core.
pub mod storage;

/// Internal agent-based components
///
/// Connection pool management is handled internally by agents. Users don't
/// need to interact with this module directly - just use `ServiceBuilder::build()`
/// and access pools via `state.db()`, `state.redis()`, etc.
///
/// The only user-facing types from this module are:
/// - [`BackgroundWorker`](agents::BackgroundWorker) - for managed background tasks
/// - [`TaskStatus`](agents::TaskStatus) - for checking background task status
/// - [`HealthStatus`](agents::HealthStatus) - for health check results
pub mod agents;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{Config, SecurityHeadersConfig};

    pub use crate::error::{Error, Result};
    pub use crate::health::{health, readiness, pool_metrics};
    pub use crate::ids::{MakeTypedRequestId, RequestId, RequestIdError};
    pub use crate::pool_health::PoolHealthSummary;

    #[cfg(feature = "database")]
    pub use crate::pool_health::DatabasePoolHealth;

    #[cfg(feature = "cache")]
    pub use crate::pool_health::RedisPoolHealth;

    pub use crate::middleware::{
        apply_security_headers, CompiledRoutePatterns, RateLimit, RateLimitConfig,
        RequestTrackingConfig, PROPAGATE_HEADERS, SENSITIVE_HEADERS, normalize_path,
        request_id_layer, request_id_propagation_layer, sensitive_headers_layer,
    };

    #[cfg(feature = "jwt")]
    pub use crate::middleware::{Claims, JwtAuth};

    #[cfg(all(feature = "jwt", feature = "cache"))]
    pub use crate::middleware::{JwtRevocation, RedisJwtRevocation};

    pub use crate::server::Server;
    pub use crate::service_builder::{ActonService, ServiceBuilder, VersionedRoutes};
    pub use crate::state::{AppState, AppStateBuilder};
    pub use crate::versioning::{
        ApiVersion, DeprecationInfo, VersionedApiBuilder, VersionedResponse,
        extract_version_from_path, versioned_router,
    };
    pub use crate::responses::{
        Accepted, Conflict, Created, FieldError, NoContent, Success, ValidationError,
    };

    #[cfg(feature = "resilience")]
    pub use crate::middleware::{CircuitBreaker, ResilienceConfig};

    #[cfg(feature = "governor")]
    pub use crate::middleware::{GovernorConfig, GovernorRateLimit, RateLimitExceeded, RouteRateLimitConfig};

    #[cfg(feature = "observability")]
    pub use crate::observability::init_tracing;

    // Re-export axum Html for non-templated HTML responses
    pub use axum::response::Html;

    // Background task management (user-facing)
    pub use crate::agents::{BackgroundWorker, TaskStatus};

    // Health status types (for checking aggregated health)
    pub use crate::agents::{AggregatedHealthResponse, HealthStatus};

    pub use axum::{
        extract::{Path, Query, State},
        http::{HeaderMap, HeaderValue, StatusCode},
        response::{IntoResponse, Json, Response},
        routing::{delete, get, patch, post, put},
        Extension, Router,
    };

    pub use serde::{Deserialize, Serialize};

    // Re-export tracing macros and types
    pub use tracing::{debug, error, info, instrument, trace, warn, Level, Span};

    // Re-export tokio for async runtime
    pub use tokio;

    // Re-export async-trait for async trait definitions
    pub use async_trait::async_trait;

    // Re-export error handling utilities
    pub use thiserror::Error;
    pub use anyhow::{self, Context as AnyhowContext};

    // Re-export time utilities
    pub use chrono::{DateTime, Duration as ChronoDuration, NaiveDateTime, Utc};

    // Re-export UUID
    pub use uuid::Uuid;

    // Re-export futures utilities
    pub use futures::{future, stream, Future, Stream, StreamExt, TryFutureExt, TryStreamExt};

    // Re-export HTTP types
    pub use http::{Method, Uri};

    // Re-export acton-reactive prelude for actor system
    pub use acton_reactive::prelude::*;
}
