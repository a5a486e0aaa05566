//! Registered nodes

use axum::{Json, extract::State};
use serde::Serialize;

use crate::{api::state::ApiState, coordinator::NodeSummary};

#[derive(Debug, Serialize)]
pub struct NodesResponse {
    pub nodes: Vec<NodeSummary>,
    pub count: usize,
}

/// GET /api/v1/nodes
pub async fn list_nodes(State(state): State<ApiState>) -> Json<NodesResponse> {
    let nodes = state.registry.snapshot().await;
    Json(NodesResponse {
        count: nodes.len(),
        nodes,
    })
}
