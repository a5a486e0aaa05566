//! Integration tests for API endpoints
//!
//! These tests verify that:
//! - All read endpoints return the coordinator's state
//! - Query parameters filter metrics, alerts and history
//! - Resolving history entries works once per entry
//! - Authentication middleware functions properly

use std::{net::SocketAddr, sync::Arc, time::Duration};

use fleet_monitoring::{
    Metric,
    api::{ApiState, spawn_api_server},
    config::{ApiConfig, CoordinatorConfig},
    coordinator::Coordinator,
    history::{AlertHistory, MemoryHistory},
    notify::Notifier,
    protocol::Payload,
};
use pretty_assertions::assert_eq;
use reqwest::StatusCode;
use serde_json::Value;

use crate::helpers::*;

const TOKEN: &str = "test-token";

async fn spawn_test_api(coordinator: &Coordinator) -> SocketAddr {
    let config = ApiConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        auth_token: Some(TOKEN.to_string()),
        enable_cors: true,
    };
    spawn_api_server(&config, ApiState::from_coordinator(coordinator))
        .await
        .unwrap()
}

async fn coordinator_with_history() -> Coordinator {
    let config = CoordinatorConfig {
        thresholds: vec![threshold("cpu.percent", ">", 90.0, "critical")],
        ..test_coordinator_config()
    };
    let history: Arc<dyn AlertHistory> = Arc::new(MemoryHistory::new(100));
    Coordinator::start(config, Notifier::new(Duration::from_secs(1)), Some(history))
        .await
        .unwrap()
}

async fn get(addr: SocketAddr, route: &str) -> (StatusCode, Value) {
    let response = reqwest::Client::new()
        .get(format!("http://{addr}{route}"))
        .bearer_auth(TOKEN)
        .send()
        .await
        .unwrap();
    let status = response.status();
    (status, response.json().await.unwrap())
}

async fn post(addr: SocketAddr, route: &str) -> (StatusCode, Value) {
    let response = reqwest::Client::new()
        .post(format!("http://{addr}{route}"))
        .bearer_auth(TOKEN)
        .send()
        .await
        .unwrap();
    let status = response.status();
    (status, response.json().await.unwrap())
}

#[tokio::test]
async fn test_health_and_nodes() {
    let coordinator = coordinator_with_history().await;
    let addr = spawn_test_api(&coordinator).await;

    let (status, body) = get(addr, "/api/v1/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["nodes"], 0);

    let _node = TestConnection::join(&coordinator, "api-node").await;

    let (status, body) = get(addr, "/api/v1/nodes").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 1);
    assert_eq!(body["nodes"][0]["node_id"], "api-node");

    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_metrics_filtered_by_name_and_tag() {
    let coordinator = coordinator_with_history().await;
    let addr = spawn_test_api(&coordinator).await;

    let mut node = TestConnection::join(&coordinator, "db").await;
    node.send(Payload::Metric {
        metrics: vec![
            Metric::new("disk.percent", 50.0).tag("mount", "/"),
            Metric::new("disk.percent", 80.0).tag("mount", "/var"),
            Metric::new("cpu.percent", 10.0),
        ],
    })
    .await;

    let monitor = coordinator.monitor();
    let monitor = &monitor;
    assert!(
        eventually(move || async move { monitor.lock().await.metric_names().len() == 2 }).await
    );

    let (_, body) = get(addr, "/api/v1/metrics").await;
    assert_eq!(body["count"], 3);

    let (_, body) = get(addr, "/api/v1/metrics?name=disk.percent&mount=/var").await;
    assert_eq!(body["count"], 1);
    assert_eq!(body["metrics"][0]["value"], 80.0);
    assert_eq!(body["metrics"][0]["source"], "db");

    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_alerts_history_and_resolution() {
    let coordinator = coordinator_with_history().await;
    let addr = spawn_test_api(&coordinator).await;

    let mut node = TestConnection::join(&coordinator, "hot").await;
    node.send(Payload::Metric {
        metrics: vec![Metric::new("cpu.percent", 99.0)],
    })
    .await;

    let monitor = coordinator.monitor();
    let monitor = &monitor;
    assert!(
        eventually(move || async move { !monitor.lock().await.get_alerts(None).is_empty() }).await
    );

    let (_, body) = get(addr, "/api/v1/alerts?level=critical").await;
    assert_eq!(body["count"], 1);
    let (_, body) = get(addr, "/api/v1/alerts?level=info").await;
    assert_eq!(body["count"], 0);
    let (status, _) = get(addr, "/api/v1/alerts?level=apocalyptic").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    coordinator.sweep_now().await.unwrap();

    let (_, body) = get(addr, "/api/v1/alerts").await;
    assert_eq!(body["count"], 0);

    let (status, body) = get(addr, "/api/v1/alerts/history").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 1);
    assert_eq!(body["entries"][0]["metric"], "cpu.percent");
    assert_eq!(body["entries"][0]["resolved"], false);
    let id = body["entries"][0]["id"].as_i64().unwrap();

    let (status, body) = post(addr, &format!("/api/v1/alerts/{id}/resolve")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["resolved"], true);

    let (status, _) = post(addr, &format!("/api/v1/alerts/{id}/resolve")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, body) = get(addr, "/api/v1/alerts/history?resolved=false").await;
    assert_eq!(body["count"], 0);

    let (_, body) = get(addr, "/api/v1/alerts/stats").await;
    assert_eq!(body["total"], 1);
    assert_eq!(body["resolved"], 1);
    assert_eq!(body["by_level"]["critical"], 1);

    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_history_endpoints_without_history() {
    let coordinator = start_coordinator(test_coordinator_config(), vec![]).await;
    let addr = spawn_test_api(&coordinator).await;

    let (status, body) = get(addr, "/api/v1/alerts/stats").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(body["error"].is_string());

    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_auth_required() {
    let coordinator = start_coordinator(test_coordinator_config(), vec![]).await;
    let addr = spawn_test_api(&coordinator).await;
    let client = reqwest::Client::new();

    let response = client
        .get(format!("http://{addr}/api/v1/health"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let body: Value = response.json().await.unwrap();
    assert!(body["error"].is_string());

    let response = client
        .get(format!("http://{addr}/api/v1/health"))
        .bearer_auth("wrong")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_cors_preflight_needs_no_token() {
    let coordinator = start_coordinator(test_coordinator_config(), vec![]).await;
    let addr = spawn_test_api(&coordinator).await;

    let response = reqwest::Client::new()
        .request(
            reqwest::Method::OPTIONS,
            format!("http://{addr}/api/v1/nodes"),
        )
        .header("Origin", "http://dashboard.example")
        .header("Access-Control-Request-Method", "GET")
        .header("Access-Control-Request-Headers", "authorization")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(
        response
            .headers()
            .contains_key("access-control-allow-origin")
    );

    coordinator.shutdown().await;
}

