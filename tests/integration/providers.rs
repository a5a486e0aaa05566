//! Notification providers against mock HTTP endpoints

use std::{collections::BTreeSet, time::Duration};

use chrono::Utc;
use fleet_monitoring::{
    alerts::{Alert, AlertLevel},
    monitors::threshold::Operator,
    notify::{Notifier, ProviderConfig},
};
use pretty_assertions::assert_eq;
use serde_json::json;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn disk_alert() -> Alert {
    Alert {
        metric: "disk.percent".to_string(),
        observed_value: 96.5,
        threshold_value: 90.0,
        operator: Operator::GreaterThan,
        level: AlertLevel::Critical,
        source_node: "storage-2".to_string(),
        raised_at: Utc::now(),
        nodes: BTreeSet::from(["storage-1".to_string(), "storage-2".to_string()]),
    }
}

fn notifier_for(configs: &[ProviderConfig], timeout: Duration) -> Notifier {
    Notifier::from_configs(configs, timeout)
}

#[tokio::test]
async fn test_webhook_posts_alert_json() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/alerts"))
        .and(body_partial_json(json!({
            "alert": {
                "metric": "disk.percent",
                "level": "critical",
                "source_node": "storage-2",
            }
        })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&mock_server)
        .await;

    let notifier = notifier_for(
        &[ProviderConfig::Webhook {
            url: format!("{}/alerts", mock_server.uri()),
        }],
        Duration::from_secs(2),
    );

    assert_eq!(notifier.notify(&disk_alert()).await, vec![true]);
}

#[tokio::test]
async fn test_webhook_error_status_is_not_delivered() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&mock_server)
        .await;

    let notifier = notifier_for(
        &[
            ProviderConfig::Webhook {
                url: mock_server.uri(),
            },
            ProviderConfig::Log,
        ],
        Duration::from_secs(2),
    );

    assert_eq!(notifier.notify(&disk_alert()).await, vec![false, true]);
}

#[tokio::test]
async fn test_slack_receives_blocks() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/services/T000/B000"))
        .and(body_partial_json(json!({
            "blocks": [{ "type": "section" }, { "type": "section" }]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .expect(1)
        .mount(&mock_server)
        .await;

    let notifier = notifier_for(
        &[ProviderConfig::Slack {
            webhook_url: format!("{}/services/T000/B000", mock_server.uri()),
        }],
        Duration::from_secs(2),
    );

    assert_eq!(notifier.notify(&disk_alert()).await, vec![true]);
}

#[tokio::test]
async fn test_discord_receives_embed_and_mention() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/webhooks/1/abc"))
        .and(body_partial_json(json!({
            "embeds": [{ "color": 15158332 }]
        })))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&mock_server)
        .await;

    let notifier = notifier_for(
        &[ProviderConfig::Discord {
            url: format!("{}/api/webhooks/1/abc", mock_server.uri()),
            user_id: Some("1234".to_string()),
        }],
        Duration::from_secs(2),
    );

    assert_eq!(notifier.notify(&disk_alert()).await, vec![true]);

    let requests = mock_server.received_requests().await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert!(body["content"].as_str().unwrap().contains("<@1234>"));
}

#[tokio::test]
async fn test_slow_provider_times_out() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
        .mount(&mock_server)
        .await;

    let notifier = notifier_for(
        &[
            ProviderConfig::Webhook {
                url: mock_server.uri(),
            },
            ProviderConfig::Log,
        ],
        Duration::from_millis(200),
    );

    let started = std::time::Instant::now();
    assert_eq!(notifier.notify(&disk_alert()).await, vec![false, true]);
    assert!(started.elapsed() < Duration::from_secs(4));
}
