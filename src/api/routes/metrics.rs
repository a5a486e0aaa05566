//! Metrics stored in the coordinator's monitor

use std::collections::{BTreeMap, HashMap};

use axum::{
    Json,
    extract::{Query, State},
};
use serde::Serialize;

use crate::{MetricQuery, api::state::ApiState, monitors::StoredMetric};

#[derive(Debug, Serialize)]
pub struct MetricsResponse {
    pub metrics: Vec<StoredMetric>,
    pub count: usize,
}

/// GET /api/v1/metrics?name=<name>&<tag>=<value>
///
/// `name` selects the metric name; every other parameter is a tag filter.
pub async fn get_metrics(
    State(state): State<ApiState>,
    Query(mut params): Query<HashMap<String, String>>,
) -> Json<MetricsResponse> {
    let name = params.remove("name");
    let tags: BTreeMap<String, String> = params.into_iter().collect();
    let query = MetricQuery {
        name,
        tags: (!tags.is_empty()).then_some(tags),
    };

    let metrics = state.monitor.lock().await.get_stored(&query);
    Json(MetricsResponse {
        count: metrics.len(),
        metrics,
    })
}
