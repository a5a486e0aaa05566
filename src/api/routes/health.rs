//! Health check endpoint

use axum::{Json, extract::State};
use serde::Serialize;

use crate::api::state::ApiState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: String,
    pub nodes: usize,
}

/// GET /api/v1/health
///
/// Returns a simple health check response with the number of connected nodes
pub async fn health_check(State(state): State<ApiState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        nodes: state.registry.len().await,
    })
}
