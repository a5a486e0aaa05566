use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::{error, info, instrument};

use super::NotificationProvider;
use crate::{
    alerts::{Alert, AlertLevel},
    error::NotificationError,
};

#[derive(Debug, Clone, Serialize)]
pub struct Message {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub embeds: Vec<Embed>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Embed {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<u32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<EmbedField>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub footer: Option<EmbedFooter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EmbedField {
    pub name: String,
    pub value: String,
    pub inline: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct EmbedFooter {
    pub text: String,
}

#[derive(Debug, Default)]
pub struct MessageBuilder {
    content: Option<String>,
    embeds: Vec<Embed>,
}

impl MessageBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn content(mut self, content: impl ToString) -> Self {
        self.content = Some(content.to_string());
        self
    }

    pub fn add_embed(mut self, embed: Embed) -> Self {
        self.embeds.push(embed);
        self
    }

    pub fn build(self) -> Message {
        Message {
            content: self.content,
            embeds: self.embeds,
        }
    }
}

/// Discord webhook rendering alerts as embeds, optionally pinging a user
#[derive(Debug, Clone)]
pub struct DiscordProvider {
    client: Client,
    url: String,
    user_id: Option<String>,
}

impl DiscordProvider {
    pub fn new(client: Client, url: impl Into<String>, user_id: Option<String>) -> Self {
        Self {
            client,
            url: url.into(),
            user_id,
        }
    }

    pub fn build_embed(alert: &Alert) -> Embed {
        let (title, color) = match alert.level {
            AlertLevel::Critical => ("🔥 Critical Alert", 15158332), // Red
            AlertLevel::Warning => ("⚠️ Warning", 15105570),         // Orange
            AlertLevel::Info => ("ℹ️ Info", 5793266),                 // Light blue
        };

        Embed {
            title: Some(format!("{title}: {}", alert.metric)),
            description: Some(format!(
                "**{}** crossed its threshold on {}",
                alert.metric,
                alert.node_list()
            )),
            color: Some(color),
            fields: vec![
                EmbedField {
                    name: "📈 Observed".to_string(),
                    value: format!("{:.2}", alert.observed_value),
                    inline: true,
                },
                EmbedField {
                    name: "⚠️ Threshold".to_string(),
                    value: format!("{} {}", alert.operator, alert.threshold_value),
                    inline: true,
                },
                EmbedField {
                    name: "📊 Status".to_string(),
                    value: progress_bar(alert.observed_value, alert.threshold_value),
                    inline: false,
                },
            ],
            footer: Some(EmbedFooter {
                text: format!("Reported by {}", alert.source_node),
            }),
            timestamp: Some(alert.raised_at.to_rfc3339()),
        }
    }

    pub fn build_message(&self, alert: &Alert) -> Message {
        let mut builder = MessageBuilder::new().add_embed(Self::build_embed(alert));
        if let Some(user_id) = &self.user_id {
            builder = builder.content(format!(
                "{} ({} ~ {:.1}) <@{user_id}>",
                alert.level, alert.metric, alert.observed_value
            ));
        }
        builder.build()
    }
}

fn progress_bar(current: f64, limit: f64) -> String {
    if limit <= 0.0 || !limit.is_finite() {
        return format!("`{current:.1}`");
    }

    let ratio = current / limit;
    let percentage = ratio * 100.0;
    let filled = ((ratio * 10.0).max(0.0) as usize).min(10);
    let bar = "█".repeat(filled) + &"░".repeat(10 - filled);
    let status_emoji = if percentage >= 100.0 {
        "🔴"
    } else if percentage >= 80.0 {
        "🟠"
    } else if percentage >= 60.0 {
        "🟡"
    } else {
        "🟢"
    };

    format!("{status_emoji} `{bar}` {percentage:.1}% of threshold")
}

#[async_trait]
impl NotificationProvider for DiscordProvider {
    fn name(&self) -> &str {
        "discord"
    }

    #[instrument(skip_all)]
    async fn send(&self, alert: &Alert) -> Result<bool, NotificationError> {
        let message = self.build_message(alert);
        let response = self.client.post(&self.url).json(&message).send().await?;

        let status = response.status();
        if !status.is_success() {
            if let Ok(error_text) = response.text().await {
                error!("Discord API error response: {}", error_text);
            }
            return Err(NotificationError::Status {
                provider: self.name().to_string(),
                status: status.as_u16(),
            });
        }

        info!("successfully sent Discord message");
        Ok(true)
    }
}
