use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use tracing::{info, instrument};

use super::NotificationProvider;
use crate::{alerts::Alert, error::NotificationError};

/// Posts the alert as a JSON document to an arbitrary endpoint
#[derive(Debug, Clone)]
pub struct WebhookProvider {
    client: Client,
    url: String,
}

impl WebhookProvider {
    pub fn new(client: Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl NotificationProvider for WebhookProvider {
    fn name(&self) -> &str {
        "webhook"
    }

    #[instrument(skip_all, fields(url = %self.url))]
    async fn send(&self, alert: &Alert) -> Result<bool, NotificationError> {
        let payload = json!({
            "message": format!("{} alert: {}", alert.level, alert.summary()),
            "alert": alert,
        });

        let response = self.client.post(&self.url).json(&payload).send().await?;
        if !response.status().is_success() {
            return Err(NotificationError::Status {
                provider: self.name().to_string(),
                status: response.status().as_u16(),
            });
        }

        info!("successfully sent webhook alert");
        Ok(true)
    }
}
