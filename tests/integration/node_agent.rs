//! Node agent against a scripted coordinator
//!
//! These tests verify that:
//! - JOIN is the first message, followed by METRIC then HEARTBEAT
//! - CONFIG is applied as a whole or not at all
//! - QUERY is answered with a RESPONSE to the requester
//! - ALERT is buffered locally
//! - Local alerts do not pile up on the node
//! - Losing the coordinator, or it no longer reading, ends the session

use std::time::Duration;

use assert_matches::assert_matches;
use fleet_monitoring::{
    Metric, MetricQuery,
    alerts::{Alert, AlertLevel},
    config::NodeConfig,
    monitors::threshold::{Operator, ThresholdConfig},
    node::NodeAgent,
    protocol::{COORDINATOR_ID, ConfigUpdate, Message, NodeState, Payload, frame::Received},
};
use pretty_assertions::assert_eq;

use crate::helpers::*;

async fn started_agent(node_id: &str) -> (NodeAgent, TestConnection) {
    let coordinator = FakeCoordinator::bind().await;
    let collector = fixed_collector(
        vec![Metric::new("cpu.percent", 42.0), Metric::new("memory.percent", 10.0)],
        Duration::from_millis(50),
    );
    let mut agent =
        NodeAgent::with_collector(test_node_config(node_id, coordinator.port()), collector)
            .unwrap();
    agent.start().await.unwrap();
    let connection = coordinator.accept().await;
    (agent, connection)
}

fn from_coordinator(node_id: &str, payload: Payload) -> Message {
    Message::new(COORDINATOR_ID, node_id, payload)
}

#[tokio::test]
async fn test_join_then_metric_then_heartbeat() {
    let (mut agent, mut coordinator) = started_agent("n1").await;
    assert_eq!(agent.state(), NodeState::Active);

    let join = coordinator.recv().await;
    assert_eq!(join.source, "n1");
    assert_eq!(join.target, COORDINATOR_ID);
    assert_matches!(join.payload, Payload::Join { node_id } if node_id == "n1");

    let metric = coordinator.recv().await;
    let Payload::Metric { metrics } = metric.payload else {
        panic!("expected METRIC after JOIN");
    };
    let names: Vec<_> = metrics.iter().map(|m| m.name.as_str()).collect();
    assert_eq!(names, vec!["cpu.percent", "memory.percent"]);

    assert_matches!(coordinator.recv().await.payload, Payload::Heartbeat);

    // the next report follows the same order
    assert_matches!(coordinator.recv().await.payload, Payload::Metric { .. });
    assert_matches!(coordinator.recv().await.payload, Payload::Heartbeat);

    agent.stop().await;
}

#[tokio::test]
async fn test_config_updates_collector_and_rules() {
    let (mut agent, mut coordinator) = started_agent("n2").await;

    let update = ConfigUpdate {
        interval_secs: Some(2),
        thresholds: Some(vec![ThresholdConfig {
            id: Some("hot-cpu".to_string()),
            ..threshold("cpu.percent", ">", 40.0, "warning")
        }]),
        ..ConfigUpdate::default()
    };
    coordinator
        .send_message(&from_coordinator("n2", Payload::Config { config: update }))
        .await;

    let collector = agent.collector();
    let collector = &collector;
    assert!(
        eventually(move || async move {
            collector.lock().await.interval() == Duration::from_secs(2)
        })
        .await
    );

    let monitor = agent.monitor();
    let ids: Vec<_> = monitor
        .lock()
        .await
        .thresholds()
        .iter()
        .map(|t| t.id.clone())
        .collect();
    assert_eq!(ids, vec!["hot-cpu".to_string()]);

    agent.stop().await;
}

#[tokio::test]
async fn test_invalid_config_is_rejected_whole() {
    let (mut agent, mut coordinator) = started_agent("n3").await;

    let invalid = ConfigUpdate {
        interval_secs: Some(0),
        thresholds: Some(vec![threshold("cpu.percent", ">", 1.0, "critical")]),
        ..ConfigUpdate::default()
    };
    let bad_rule = ConfigUpdate {
        interval_secs: Some(7),
        thresholds: Some(vec![threshold("cpu.percent", "!=", 1.0, "critical")]),
        ..ConfigUpdate::default()
    };
    let valid = ConfigUpdate {
        thresholds: Some(vec![ThresholdConfig {
            id: Some("marker".to_string()),
            ..threshold("memory.percent", "<", 5.0, "info")
        }]),
        ..ConfigUpdate::default()
    };

    for config in [invalid, bad_rule, valid] {
        coordinator
            .send_message(&from_coordinator("n3", Payload::Config { config }))
            .await;
    }

    let monitor = agent.monitor();
    let monitor = &monitor;
    assert!(
        eventually(move || async move {
            monitor
                .lock()
                .await
                .thresholds()
                .iter()
                .any(|t| t.id == "marker")
        })
        .await
    );

    // messages are handled in order, so both rejected updates left no trace
    assert_eq!(monitor.lock().await.thresholds().len(), 1);
    assert_eq!(
        agent.collector().lock().await.interval(),
        Duration::from_millis(50)
    );

    agent.stop().await;
}

#[tokio::test]
async fn test_query_answered_from_local_monitor() {
    let (mut agent, mut coordinator) = started_agent("n4").await;

    // once a METRIC arrived the same batch is in the local monitor
    coordinator
        .recv_until(|m| matches!(m.payload, Payload::Metric { .. }))
        .await;

    coordinator
        .send_message(&from_coordinator(
            "n4",
            Payload::Query {
                request_id: 3,
                query: MetricQuery::by_name("cpu.percent"),
            },
        ))
        .await;

    let response = coordinator
        .recv_until(|m| matches!(m.payload, Payload::Response { .. }))
        .await;
    assert_eq!(response.source, "n4");
    assert_eq!(response.target, COORDINATOR_ID);
    let Payload::Response { request_id, result } = response.payload else {
        unreachable!();
    };
    assert_eq!(request_id, 3);
    assert!(!result.is_empty());
    assert!(result.iter().all(|m| m.name == "cpu.percent"));

    agent.stop().await;
}

#[tokio::test]
async fn test_alerts_are_buffered() {
    let (mut agent, mut coordinator) = started_agent("n5").await;

    let alert = Alert {
        metric: "cpu.percent".to_string(),
        observed_value: 97.0,
        threshold_value: 90.0,
        operator: Operator::GreaterThan,
        level: AlertLevel::Critical,
        source_node: "n5".to_string(),
        raised_at: chrono::Utc::now(),
        nodes: ["n5".to_string()].into(),
    };
    coordinator
        .send_message(&from_coordinator(
            "n5",
            Payload::Alert {
                alert: alert.clone(),
            },
        ))
        .await;

    let agent_ref = &agent;
    assert!(
        eventually(move || async move { agent_ref.received_alerts().await.len() == 1 }).await
    );
    assert_eq!(agent.received_alerts().await[0], alert);

    agent.stop().await;
}

#[tokio::test]
async fn test_peer_close_disconnects() {
    let (mut agent, coordinator) = started_agent("n6").await;
    let mut states = agent.subscribe();

    drop(coordinator);

    tokio::time::timeout(RECV_TIMEOUT, agent.wait())
        .await
        .expect("agent did not notice the closed connection");
    assert_eq!(agent.state(), NodeState::Disconnected);
    assert_eq!(*states.borrow_and_update(), NodeState::Disconnected);
}

#[tokio::test]
async fn test_stop_sends_leave_and_closes() {
    let (mut agent, mut coordinator) = started_agent("n7").await;

    agent.stop().await;
    assert_eq!(agent.state(), NodeState::Disconnected);

    let leave = coordinator
        .recv_until(|m| matches!(m.payload, Payload::Leave))
        .await;
    assert_eq!(leave.source, "n7");
    assert_matches!(coordinator.recv_received().await, Received::Closed);
}

#[tokio::test]
async fn test_agent_can_restart_after_disconnect() {
    let fake = FakeCoordinator::bind().await;
    let collector = fixed_collector(vec![Metric::new("cpu.percent", 1.0)], Duration::from_millis(50));
    let mut agent =
        NodeAgent::with_collector(test_node_config("n8", fake.port()), collector).unwrap();

    agent.start().await.unwrap();
    drop(fake.accept().await);
    tokio::time::timeout(RECV_TIMEOUT, agent.wait()).await.unwrap();

    agent.start().await.unwrap();
    let mut second = fake.accept().await;
    assert_matches!(second.recv().await.payload, Payload::Join { .. });

    agent.stop().await;
}

#[tokio::test]
async fn test_local_alerts_do_not_accumulate() {
    let fake = FakeCoordinator::bind().await;
    let collector = fixed_collector(vec![Metric::new("cpu.percent", 99.0)], Duration::from_millis(10));
    let config = NodeConfig {
        thresholds: vec![threshold("cpu.percent", ">", 90.0, "critical")],
        ..test_node_config("n9", fake.port())
    };
    let mut agent = NodeAgent::with_collector(config, collector).unwrap();
    agent.start().await.unwrap();
    let _connection = fake.accept().await;

    let monitor = agent.monitor();
    let monitor = &monitor;
    assert!(
        eventually(move || async move {
            monitor
                .lock()
                .await
                .get_metrics(&MetricQuery::by_name("cpu.percent"))
                .len()
                >= 20
        })
        .await
    );
    assert!(monitor.lock().await.get_alerts(None).is_empty());

    agent.stop().await;
}

#[tokio::test]
async fn test_coordinator_that_stops_reading_ends_session() {
    let fake = FakeCoordinator::bind().await;
    let padding = "x".repeat(200);
    let metrics = (0..1000)
        .map(|i| Metric::new(format!("bulk.{i}.{padding}"), i as f64))
        .collect();
    let config = NodeConfig {
        write_timeout: Duration::from_millis(200),
        ..test_node_config("n10", fake.port())
    };
    let mut agent =
        NodeAgent::with_collector(config, fixed_collector(metrics, Duration::from_millis(10)))
            .unwrap();
    agent.start().await.unwrap();
    // accepted but never read
    let _stalled = fake.accept().await;

    tokio::time::timeout(Duration::from_secs(10), agent.wait())
        .await
        .expect("agent kept writing to a coordinator that stopped reading");
    assert_eq!(agent.state(), NodeState::Disconnected);

    tokio::time::timeout(Duration::from_secs(1), agent.stop())
        .await
        .expect("stop blocked after the session ended");
}

