//! Failure scenarios
//!
//! These tests verify that the system handles failures gracefully:
//! - Undecodable messages are dropped without closing the connection
//! - Repeated protocol errors close the connection
//! - Silent nodes are evicted, disconnected nodes removed
//! - A node that stops reading is dropped and cannot stall shutdown
//! - A failing provider does not keep others from delivering
//! - Invalid configuration and occupied ports are reported

use std::{net::SocketAddr, sync::Arc, time::Duration};

use assert_matches::assert_matches;
use fleet_monitoring::{
    Metric, MetricQuery,
    config::CoordinatorConfig,
    coordinator::Coordinator,
    error::{ConfigurationError, CoordinatorError},
    notify::{Notifier, WebhookProvider},
    protocol::{COORDINATOR_ID, Message, Payload, frame::Received},
};
use pretty_assertions::assert_eq;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::helpers::*;

#[tokio::test]
async fn test_malformed_messages_keep_connection() {
    let coordinator = start_coordinator(test_coordinator_config(), vec![]).await;
    let mut node = TestConnection::connect(coordinator.local_addr(), "flaky").await;

    node.send_raw(b"definitely not json").await;
    node.send_raw(br#"{"kind":"BOGUS","source":"flaky","target":"coordinator","payload":{},"sent_at":"2025-01-01T00:00:00Z"}"#)
        .await;
    node.send_raw(br#"{"kind":"JOIN","source":"flaky","target":"coordinator","payload":{"id":1},"sent_at":"2025-01-01T00:00:00Z"}"#)
        .await;
    node.send(Payload::Join {
        node_id: "flaky".to_string(),
    })
    .await;

    let registry = coordinator.registry();
    assert!(eventually(move || async move { registry.contains("flaky").await }).await);

    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_repeated_protocol_errors_close_connection() {
    let config = CoordinatorConfig {
        max_protocol_errors: 3,
        ..test_coordinator_config()
    };
    let coordinator = start_coordinator(config, vec![]).await;
    let mut node = TestConnection::join(&coordinator, "noisy").await;

    for _ in 0..3 {
        node.send_raw(b"{").await;
    }

    assert_matches!(node.recv_received().await, Received::Closed);
    let registry = coordinator.registry();
    assert!(eventually(move || async move { !registry.contains("noisy").await }).await);

    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_valid_message_resets_error_count() {
    let config = CoordinatorConfig {
        max_protocol_errors: 2,
        ..test_coordinator_config()
    };
    let coordinator = start_coordinator(config, vec![]).await;
    let mut node = TestConnection::join(&coordinator, "recovering").await;

    node.send_raw(b"{").await;
    node.send(Payload::Heartbeat).await;
    node.send_raw(b"{").await;
    node.send(Payload::Metric {
        metrics: vec![Metric::new("cpu.percent", 1.0)],
    })
    .await;

    let monitor = coordinator.monitor();
    let monitor = &monitor;
    assert!(
        eventually(move || async move { !monitor.lock().await.metric_names().is_empty() }).await
    );
    assert!(coordinator.registry().contains("recovering").await);

    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_silent_node_is_evicted() {
    let config = CoordinatorConfig {
        stale_threshold: Duration::from_millis(100),
        ..test_coordinator_config()
    };
    let coordinator = start_coordinator(config, vec![]).await;
    let _silent = TestConnection::join(&coordinator, "silent").await;
    let mut chatty = TestConnection::join(&coordinator, "chatty").await;

    tokio::time::sleep(Duration::from_millis(150)).await;
    chatty.send(Payload::Heartbeat).await;

    let registry = coordinator.registry();
    let refreshed = registry
        .get("chatty")
        .await
        .map(|node| node.last_heartbeat_at);
    assert!(
        eventually(move || async move {
            registry.get("chatty").await.map(|node| node.last_heartbeat_at) != refreshed
        })
        .await
    );

    let report = coordinator.sweep_now().await.unwrap();
    assert_eq!(report.evicted, vec!["silent".to_string()]);
    assert!(!registry.contains("silent").await);
    assert!(registry.contains("chatty").await);

    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_heartbeat_only_refreshes_own_record() {
    let config = CoordinatorConfig {
        stale_threshold: Duration::from_millis(100),
        ..test_coordinator_config()
    };
    let coordinator = start_coordinator(config, vec![]).await;
    let _quiet = TestConnection::join(&coordinator, "quiet").await;
    let mut other = TestConnection::join(&coordinator, "other").await;

    tokio::time::sleep(Duration::from_millis(150)).await;
    other
        .send_message(&Message::new("quiet", COORDINATOR_ID, Payload::Heartbeat))
        .await;
    other.send(Payload::Heartbeat).await;

    let registry = coordinator.registry();
    let refreshed = registry
        .get("other")
        .await
        .map(|node| node.last_heartbeat_at);
    assert!(
        eventually(move || async move {
            registry.get("other").await.map(|node| node.last_heartbeat_at) != refreshed
        })
        .await
    );

    let report = coordinator.sweep_now().await.unwrap();
    assert_eq!(report.evicted, vec!["quiet".to_string()]);

    coordinator.shutdown().await;
}

/// Join `node_id`, store bulky metrics and ask for them over and over without
/// ever reading the answers
async fn flood_unread_responses(coordinator: &Coordinator, node_id: &str) -> TestConnection {
    let mut node = TestConnection::join(coordinator, node_id).await;

    let padding = "x".repeat(200);
    let metrics = (0..1000)
        .map(|i| Metric::new(format!("bulk.{i}.{padding}"), i as f64))
        .collect();
    node.send(Payload::Metric { metrics }).await;

    let monitor = coordinator.monitor();
    let monitor = &monitor;
    assert!(
        eventually(move || async move { monitor.lock().await.metric_names().len() == 1000 })
            .await
    );

    for request_id in 0..200 {
        node.send(Payload::Query {
            request_id,
            query: MetricQuery::default(),
        })
        .await;
    }
    node
}

#[tokio::test]
async fn test_node_that_stops_reading_is_dropped() {
    let config = CoordinatorConfig {
        write_timeout: Duration::from_millis(500),
        ..test_coordinator_config()
    };
    let coordinator = start_coordinator(config, vec![]).await;
    let _stalled = flood_unread_responses(&coordinator, "stalled").await;

    let registry = coordinator.registry();
    assert!(eventually(move || async move { !registry.contains("stalled").await }).await);

    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_does_not_wait_for_stalled_writes() {
    let config = CoordinatorConfig {
        write_timeout: Duration::from_secs(60),
        ..test_coordinator_config()
    };
    let coordinator = start_coordinator(config, vec![]).await;
    let _stalled = flood_unread_responses(&coordinator, "stalled").await;

    tokio::time::timeout(Duration::from_secs(5), coordinator.shutdown())
        .await
        .expect("shutdown hung on a node that stopped reading");
}

#[tokio::test]
async fn test_disconnect_removes_node() {
    let coordinator = start_coordinator(test_coordinator_config(), vec![]).await;
    let node = TestConnection::join(&coordinator, "gone").await;

    drop(node);

    let registry = coordinator.registry();
    assert!(eventually(move || async move { registry.is_empty().await }).await);

    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_failing_provider_does_not_block_others() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&mock_server)
        .await;

    let recorder = RecordingProvider::default();
    let mut notifier = Notifier::new(Duration::from_secs(2));
    notifier.add_provider(Arc::new(WebhookProvider::new(
        reqwest::Client::new(),
        format!("{}/hook", mock_server.uri()),
    )));
    notifier.add_provider(Arc::new(recorder.clone()));

    let config = CoordinatorConfig {
        thresholds: vec![threshold("memory.percent", ">", 80.0, "warning")],
        ..test_coordinator_config()
    };
    let coordinator = Coordinator::start(config, notifier, None).await.unwrap();

    let mut node = TestConnection::join(&coordinator, "mem").await;
    node.send(Payload::Metric {
        metrics: vec![Metric::new("memory.percent", 93.0)],
    })
    .await;

    let monitor = coordinator.monitor();
    let monitor = &monitor;
    assert!(
        eventually(move || async move { !monitor.lock().await.get_alerts(None).is_empty() }).await
    );

    let report = coordinator.sweep_now().await.unwrap();
    assert_eq!(report.aggregated, 1);
    assert_eq!(report.delivered, 1);
    assert_eq!(recorder.recorded().len(), 1);

    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_invalid_threshold_prevents_start() {
    let config = CoordinatorConfig {
        thresholds: vec![threshold("cpu.percent", ">", 90.0, "apocalyptic")],
        ..test_coordinator_config()
    };

    let result = Coordinator::start(config, Notifier::new(Duration::from_secs(1)), None).await;
    assert_matches!(
        result,
        Err(CoordinatorError::Configuration(ConfigurationError::UnknownLevel(_)))
    );
}

#[tokio::test]
async fn test_occupied_port_reports_bind_error() {
    let first = start_coordinator(test_coordinator_config(), vec![]).await;
    let addr: SocketAddr = first.local_addr();

    let config = CoordinatorConfig {
        port: addr.port(),
        ..test_coordinator_config()
    };
    let result = Coordinator::start(config, Notifier::new(Duration::from_secs(1)), None).await;
    assert_matches!(result, Err(CoordinatorError::Bind { .. }));

    first.shutdown().await;
}
