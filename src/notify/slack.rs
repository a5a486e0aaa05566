use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use tracing::{info, instrument};

use super::NotificationProvider;
use crate::{alerts::Alert, error::NotificationError};

/// Slack incoming webhook using a two section block layout
#[derive(Debug, Clone)]
pub struct SlackProvider {
    client: Client,
    webhook_url: String,
}

impl SlackProvider {
    pub fn new(client: Client, webhook_url: impl Into<String>) -> Self {
        Self {
            client,
            webhook_url: webhook_url.into(),
        }
    }

    pub fn build_payload(alert: &Alert) -> Value {
        json!({
            "blocks": [
                {
                    "type": "section",
                    "text": {
                        "type": "mrkdwn",
                        "text": format!(
                            "*{} Alert: {}*",
                            alert.level.as_str().to_uppercase(),
                            alert.metric
                        ),
                    },
                },
                {
                    "type": "section",
                    "fields": [
                        {
                            "type": "mrkdwn",
                            "text": format!(
                                "*Value:*\n{} ({} {})",
                                alert.observed_value, alert.operator, alert.threshold_value
                            ),
                        },
                        { "type": "mrkdwn", "text": format!("*Nodes:*\n{}", alert.node_list()) },
                        {
                            "type": "mrkdwn",
                            "text": format!("*Timestamp:*\n{}", alert.raised_at.to_rfc3339()),
                        },
                    ],
                },
            ]
        })
    }
}

#[async_trait]
impl NotificationProvider for SlackProvider {
    fn name(&self) -> &str {
        "slack"
    }

    #[instrument(skip_all)]
    async fn send(&self, alert: &Alert) -> Result<bool, NotificationError> {
        let response = self
            .client
            .post(&self.webhook_url)
            .json(&Self::build_payload(alert))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(NotificationError::Status {
                provider: self.name().to_string(),
                status: response.status().as_u16(),
            });
        }

        info!("successfully sent Slack message");
        Ok(true)
    }
}
