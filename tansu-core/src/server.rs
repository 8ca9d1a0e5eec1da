//! HTTP server with graceful shutdown. Per-route CORS, rate limiting and
//! policy enforcement live in the gateway/policy and middleware modules;
//! this layer only carries the ambient concerns every route needs:
//! tracing, panic recovery, compression, and a baseline body limit/timeout
//! sourced from the gateway's defaults.

use axum::Router;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::{
    catch_panic::CatchPanicLayer,
    compression::CompressionLayer,
    limit::RequestBodyLimitLayer,
    timeout::TimeoutLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};

use crate::{
    config::Config,
    error::Result,
    middleware::{request_id_layer, request_id_propagation_layer, sensitive_headers_layer},
};

/// Server instance
pub struct Server {
    config: Config,
}

impl Server {
    /// Create a new server instance
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Run the server with the given router
    pub async fn serve(self, app: Router) -> Result<()> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.service.port));

        tracing::info!("starting {} on {}", self.config.service.name, addr);
        self.log_middleware_config();

        let body_limit = self.config.gateway.default_body_limit_mb * 1024 * 1024;
        let timeout = Duration::from_secs(self.config.gateway.default_route_timeout_secs);

        // Layers are applied in reverse order: bottom layer is innermost/first.
        let app = app
            .layer(CompressionLayer::new())
            .layer(TimeoutLayer::with_status_code(
                http::StatusCode::REQUEST_TIMEOUT,
                timeout,
            ))
            .layer(RequestBodyLimitLayer::new(body_limit))
            .layer(
                TraceLayer::new_for_http()
                    .make_span_with(DefaultMakeSpan::new().include_headers(true))
                    .on_response(DefaultOnResponse::new().include_headers(true)),
            )
            .layer(sensitive_headers_layer())
            .layer(request_id_propagation_layer())
            .layer(request_id_layer())
            .layer(CatchPanicLayer::new());

        let listener = TcpListener::bind(&addr).await?;
        tracing::info!("server listening on {}", addr);

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        tracing::info!("server shutdown complete");
        Ok(())
    }

    fn log_middleware_config(&self) {
        tracing::info!("middleware configuration:");
        tracing::info!("  - panic recovery: enabled");
        tracing::info!("  - request id tracking: enabled");
        tracing::info!("  - sensitive header masking: enabled");
        tracing::info!("  - compression: enabled");
        tracing::info!(
            "  - request body limit: {} MB",
            self.config.gateway.default_body_limit_mb
        );
        tracing::info!(
            "  - request timeout: {} seconds",
            self.config.gateway.default_route_timeout_secs
        );
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install ctrl+c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install sigterm handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("received sigint (ctrl+c), starting graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("received sigterm, starting graceful shutdown");
        },
    }

    tracing::info!("shutdown signal received, draining requests...");
}
