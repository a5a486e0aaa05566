//! Read API for the coordinator
//!
//! Exposes the registry, the coordinator's monitor and the alert history
//! over HTTP. Everything is read-only except marking history entries resolved.
//!
//! ## Endpoints
//!
//! - `GET /api/v1/health` - Health check
//! - `GET /api/v1/nodes` - Registered nodes
//! - `GET /api/v1/metrics?name=<name>&<tag>=<value>` - Stored metrics
//! - `GET /api/v1/alerts?level=<level>` - Alerts waiting for the next sweep
//! - `GET /api/v1/alerts/history` - Alert history, newest first
//! - `GET /api/v1/alerts/stats` - Alert history statistics
//! - `POST /api/v1/alerts/{id}/resolve` - Mark a history entry resolved

#[cfg(feature = "api")]
pub mod error;
#[cfg(feature = "api")]
pub mod middleware;
#[cfg(feature = "api")]
pub mod routes;
#[cfg(feature = "api")]
pub mod state;

#[cfg(feature = "api")]
pub use error::{ApiError, ApiResult};
#[cfg(feature = "api")]
pub use state::ApiState;

#[cfg(feature = "api")]
use axum::{
    Router,
    routing::{get, post},
};
#[cfg(feature = "api")]
use std::net::SocketAddr;
#[cfg(feature = "api")]
use tracing::info;

#[cfg(feature = "api")]
use crate::config::ApiConfig;

/// Build the router with every endpoint and the configured layers
#[cfg(feature = "api")]
pub fn router(config: &ApiConfig, state: ApiState) -> Router {
    use tower_http::cors::{Any, CorsLayer};
    use tower_http::trace::TraceLayer;

    let mut app = Router::new()
        .route("/api/v1/health", get(routes::health::health_check))
        .route("/api/v1/nodes", get(routes::nodes::list_nodes))
        .route("/api/v1/metrics", get(routes::metrics::get_metrics))
        .route("/api/v1/alerts", get(routes::alerts::pending_alerts))
        .route("/api/v1/alerts/history", get(routes::alerts::alert_history))
        .route("/api/v1/alerts/stats", get(routes::alerts::alert_stats))
        .route(
            "/api/v1/alerts/:id/resolve",
            post(routes::alerts::resolve_alert),
        )
        .with_state(state);

    if let Some(token) = &config.auth_token {
        app = app.layer(axum::middleware::from_fn_with_state(
            middleware::auth::ApiToken::new(token),
            middleware::auth::require_token,
        ));
    }

    // outside of auth so preflight requests are answered without a token
    if config.enable_cors {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
        app = app.layer(cors);
    }

    app.layer(TraceLayer::new_for_http())
}

/// Spawn the API server
///
/// This starts an Axum HTTP server in a background task.
/// Returns the server's local address.
#[cfg(feature = "api")]
pub async fn spawn_api_server(config: &ApiConfig, state: ApiState) -> anyhow::Result<SocketAddr> {
    let app = router(config, state);

    let listener = tokio::net::TcpListener::bind(config.bind_addr()).await?;
    let addr = listener.local_addr()?;

    info!("API server listening on {}", addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("API server error: {}", e);
        }
    });

    Ok(addr)
}
