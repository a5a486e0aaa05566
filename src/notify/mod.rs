//! Alert delivery to external channels
//!
//! The [`Notifier`] holds an ordered list of providers and hands every alert to
//! each of them in turn. Whatever goes wrong inside a provider (an error, a
//! panic, a hung request) only turns that provider's result into `false`.

pub mod discord;
pub mod log;
pub mod slack;
pub mod webhook;

use std::{any::Any, panic::AssertUnwindSafe, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::FutureExt;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, error, instrument, warn};

use crate::{alerts::Alert, error::NotificationError};

pub use self::{
    discord::DiscordProvider, log::LogProvider, slack::SlackProvider, webhook::WebhookProvider,
};

pub const DEFAULT_PROVIDER_TIMEOUT: Duration = Duration::from_secs(10);

/// A channel alerts can be delivered through
///
/// `Ok(true)` means delivered, `Ok(false)` means the provider chose not to
/// deliver. Errors are logged by the notifier and count as `false`.
#[async_trait]
pub trait NotificationProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, alert: &Alert) -> Result<bool, NotificationError>;
}

/// Provider settings as they appear in the coordinator configuration
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderConfig {
    Webhook { url: String },
    Slack { webhook_url: String },
    Discord { url: String, user_id: Option<String> },
    Log,
}

impl ProviderConfig {
    pub fn build(&self, client: &Client) -> Arc<dyn NotificationProvider> {
        match self {
            ProviderConfig::Webhook { url } => Arc::new(WebhookProvider::new(client.clone(), url)),
            ProviderConfig::Slack { webhook_url } => {
                Arc::new(SlackProvider::new(client.clone(), webhook_url))
            }
            ProviderConfig::Discord { url, user_id } => Arc::new(DiscordProvider::new(
                client.clone(),
                url,
                user_id.clone(),
            )),
            ProviderConfig::Log => Arc::new(LogProvider),
        }
    }
}

#[derive(Clone)]
pub struct Notifier {
    providers: Vec<Arc<dyn NotificationProvider>>,
    timeout: Duration,
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("providers", &self.provider_names())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new(DEFAULT_PROVIDER_TIMEOUT)
    }
}

impl Notifier {
    pub fn new(timeout: Duration) -> Self {
        Self {
            providers: Vec::new(),
            timeout,
        }
    }

    pub fn from_configs(configs: &[ProviderConfig], timeout: Duration) -> Self {
        let client = Client::new();
        let mut notifier = Self::new(timeout);
        for config in configs {
            notifier.add_provider(config.build(&client));
        }
        notifier
    }

    pub fn add_provider(&mut self, provider: Arc<dyn NotificationProvider>) {
        debug!("adding notification provider {}", provider.name());
        self.providers.push(provider);
    }

    pub fn provider_names(&self) -> Vec<String> {
        self.providers.iter().map(|p| p.name().to_string()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Deliver `alert` through every provider, one result per provider in order
    #[instrument(skip_all, fields(metric = %alert.metric, level = %alert.level))]
    pub async fn notify(&self, alert: &Alert) -> Vec<bool> {
        let mut results = Vec::with_capacity(self.providers.len());

        for provider in &self.providers {
            let delivered = match self.send_guarded(provider.as_ref(), alert).await {
                Ok(true) => true,
                Ok(false) => {
                    warn!("{} did not deliver the alert", provider.name());
                    false
                }
                Err(e) => {
                    error!("failed to send notification via {}: {e}", provider.name());
                    false
                }
            };
            results.push(delivered);
        }

        results
    }

    async fn send_guarded(
        &self,
        provider: &dyn NotificationProvider,
        alert: &Alert,
    ) -> Result<bool, NotificationError> {
        let guarded = AssertUnwindSafe(provider.send(alert)).catch_unwind();

        match tokio::time::timeout(self.timeout, guarded).await {
            Ok(Ok(result)) => result,
            Ok(Err(panic)) => Err(NotificationError::Panicked(format!(
                "{} ({})",
                provider.name(),
                panic_message(panic.as_ref())
            ))),
            Err(_) => Err(NotificationError::Timeout {
                provider: provider.name().to_string(),
                timeout: self.timeout,
            }),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic"
    }
}
