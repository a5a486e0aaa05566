//! Alert history persistence through the SQLite backend

use std::collections::BTreeSet;

use chrono::{TimeDelta, Utc};
use fleet_monitoring::{
    alerts::{Alert, AlertLevel},
    history::{AlertHistory, HistoryConfig, HistoryFilter, sqlite::SqliteHistory},
    monitors::threshold::Operator,
};
use pretty_assertions::assert_eq;
use tempfile::tempdir;

fn alert(metric: &str, level: AlertLevel, node: &str, minutes_ago: i64) -> Alert {
    Alert {
        metric: metric.to_string(),
        observed_value: 95.0,
        threshold_value: 90.0,
        operator: Operator::GreaterThan,
        level,
        source_node: node.to_string(),
        raised_at: Utc::now() - TimeDelta::minutes(minutes_ago),
        nodes: BTreeSet::from([node.to_string(), "other".to_string()]),
    }
}

#[tokio::test]
async fn test_sqlite_history_round_trip() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("alerts.db");
    let history = SqliteHistory::new(&db_path).await.unwrap();

    let older = history
        .append(&alert("cpu.percent", AlertLevel::Warning, "a", 10))
        .await
        .unwrap();
    let newer = history
        .append(&alert("disk.percent", AlertLevel::Critical, "b", 1))
        .await
        .unwrap();
    assert_ne!(older, newer);

    let entries = history.query(&HistoryFilter::default()).await.unwrap();
    let ids: Vec<_> = entries.iter().map(|e| e.id).collect();
    assert_eq!(ids, vec![newer, older]);
    assert_eq!(
        entries[0].alert.nodes,
        BTreeSet::from(["b".to_string(), "other".to_string()])
    );
    assert!(entries.iter().all(|e| !e.resolved));

    assert!(history.resolve(older).await.unwrap());
    assert!(!history.resolve(older).await.unwrap());
    assert!(!history.resolve(9_999).await.unwrap());

    let unresolved = history
        .query(&HistoryFilter {
            resolved: Some(false),
            ..HistoryFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(unresolved.len(), 1);
    assert_eq!(unresolved[0].id, newer);

    let critical = history
        .query(&HistoryFilter {
            level: Some(AlertLevel::Critical),
            source: Some("b".to_string()),
            ..HistoryFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(critical.len(), 1);

    let stats = history.stats().await.unwrap();
    assert_eq!(stats.total, 2);
    assert_eq!(stats.resolved, 1);
    assert_eq!(stats.by_level.get("critical"), Some(&1));
    assert_eq!(stats.by_metric.get("cpu.percent"), Some(&1));

    history.close().await;
}

#[tokio::test]
async fn test_sqlite_history_survives_reopen() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("persisted.db");

    let config = HistoryConfig::Sqlite {
        path: db_path.clone(),
    };
    let id = {
        let history = config.open().await.unwrap();
        let id = history
            .append(&alert("memory.percent", AlertLevel::Info, "m", 0))
            .await
            .unwrap();
        history.resolve(id).await.unwrap();
        id
    };

    let reopened = SqliteHistory::new(&db_path).await.unwrap();
    let entries = reopened.query(&HistoryFilter::default()).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].id, id);
    assert!(entries[0].resolved);
    assert!(entries[0].resolved_at.is_some());

    reopened.close().await;
}

#[tokio::test]
async fn test_limit_caps_results() {
    let dir = tempdir().unwrap();
    let history = SqliteHistory::new(dir.path().join("limit.db")).await.unwrap();

    for minutes in 0..5 {
        history
            .append(&alert("cpu.percent", AlertLevel::Warning, "n", minutes))
            .await
            .unwrap();
    }

    let entries = history
        .query(&HistoryFilter {
            limit: 2,
            ..HistoryFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(entries.len(), 2);
    assert!(entries[0].alert.raised_at >= entries[1].alert.raised_at);

    history.close().await;
}
