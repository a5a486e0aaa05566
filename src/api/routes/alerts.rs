//! Pending alerts and alert history

use axum::{
    Json,
    extract::{Path, Query, State},
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    alerts::{Alert, AlertLevel},
    api::{
        error::{ApiError, ApiResult},
        state::ApiState,
    },
    history::{AlertHistory, HistoryEntry, HistoryFilter, HistoryStats},
};

#[derive(Debug, Deserialize)]
pub struct AlertsParams {
    pub level: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AlertsResponse {
    pub alerts: Vec<Alert>,
    pub count: usize,
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub entries: Vec<HistoryEntry>,
    pub count: usize,
}

#[derive(Debug, Serialize)]
pub struct ResolveResponse {
    pub id: i64,
    pub resolved: bool,
}

fn history(state: &ApiState) -> ApiResult<&dyn AlertHistory> {
    state.history.as_deref().ok_or(ApiError::HistoryDisabled)
}

/// GET /api/v1/alerts?level=<level>
///
/// Alerts raised since the last sweep
pub async fn pending_alerts(
    State(state): State<ApiState>,
    Query(params): Query<AlertsParams>,
) -> ApiResult<Json<AlertsResponse>> {
    let level = params
        .level
        .map(|level| level.parse::<AlertLevel>())
        .transpose()
        .map_err(|e| ApiError::InvalidRequest(e.to_string()))?;

    let alerts = state.monitor.lock().await.get_alerts(level);
    Ok(Json(AlertsResponse {
        count: alerts.len(),
        alerts,
    }))
}

/// GET /api/v1/alerts/history?level=&metric=&source=&resolved=&limit=
pub async fn alert_history(
    State(state): State<ApiState>,
    Query(filter): Query<HistoryFilter>,
) -> ApiResult<Json<HistoryResponse>> {
    let entries = history(&state)?.query(&filter).await?;
    Ok(Json(HistoryResponse {
        count: entries.len(),
        entries,
    }))
}

/// GET /api/v1/alerts/stats
pub async fn alert_stats(State(state): State<ApiState>) -> ApiResult<Json<HistoryStats>> {
    Ok(Json(history(&state)?.stats().await?))
}

/// POST /api/v1/alerts/{id}/resolve
pub async fn resolve_alert(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<ResolveResponse>> {
    if !history(&state)?.resolve(id).await? {
        return Err(ApiError::NotFound(format!(
            "no unresolved alert with id {id}"
        )));
    }

    info!("alert {id} resolved through the API");
    Ok(Json(ResolveResponse { id, resolved: true }))
}
